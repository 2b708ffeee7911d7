use anyhow::Context as _;
use serde::Serialize;

/// Prints a command's structured result: pretty JSON by default, or rendered
/// through the user's `--output` template.
pub fn format_output<T: Serialize>(value: &T, template: &str) -> anyhow::Result<()> {
    let json = serde_json::to_value(value).context("failed to encode output")?;
    if template.is_empty() {
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }
    let env = minijinja::Environment::new();
    let rendered = env
        .render_str(template, &json)
        .context("failed to render output template")?;
    println!("{rendered}");
    Ok(())
}
