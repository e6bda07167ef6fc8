fn main() -> anyhow::Result<()> {
    ledgate::run()?;
    Ok(())
}
