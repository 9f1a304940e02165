//! Templates command - list the template catalogue.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use kiln_cli::settings::load_templates;
use kiln_core::TemplateKind;

#[derive(Args)]
pub struct TemplatesArgs {
    /// YAML file extending the built-in templates
    #[arg(long, env = "KILN_TEMPLATES")]
    templates: Option<PathBuf>,

    /// Print the catalogue as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: TemplatesArgs) -> Result<()> {
    let registry = load_templates(args.templates.as_ref())?;
    let templates = registry.list();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&templates).context("Failed to serialize templates")?
        );
        return Ok(());
    }

    println!("📦 {} template(s)\n", templates.len());
    for template in templates {
        let launch = match template.kind {
            TemplateKind::Interpreter => "no server".to_string(),
            TemplateKind::Server => format!("port {}", template.resolve_port(None)),
        };
        println!("  {:<22} {} ({})", template.id, template.name, launch);
    }
    Ok(())
}
