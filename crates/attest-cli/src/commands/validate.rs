use std::path::Path;

use anyhow::Context;

use attest_core::config::{EnvSnapshot, HarnessConfig};

/// Parse, validate, and describe a configuration file. Nothing is launched;
/// the env column reflects what a run right now would see.
pub fn run(config_path: &Path) -> anyhow::Result<i32> {
    let config = HarnessConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let specs = config.resolve()?;
    let env = EnvSnapshot::capture();

    println!(
        "{}: {} service(s), settle delay {:?}",
        config_path.display(),
        specs.len(),
        config.settle_delay()
    );
    for spec in specs.values() {
        let kind = if spec.required { "required" } else { "optional" };
        let missing = env.missing_for(spec);
        let env_status = if spec.env.is_empty() {
            "no env declared".to_string()
        } else if missing.is_empty() {
            format!("{} env var(s) present", spec.env.len())
        } else {
            format!("missing: {}", missing.join(", "))
        };
        let smoke = spec.smoke_tool.as_deref().unwrap_or("-");
        println!(
            "  {:<12} {:<8} cmd={} tools={} smoke={} [{}]",
            spec.name,
            kind,
            spec.command,
            spec.tools.len(),
            smoke,
            env_status
        );
    }
    Ok(0)
}
