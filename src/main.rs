fn main() -> anyhow::Result<()> {
    voice_logit::run()
}
