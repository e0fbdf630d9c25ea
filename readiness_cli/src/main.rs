use anyhow::Context;
use clap::Parser;
use readiness_cli::cli::Cli;
use readiness_cli::commands::App;
use readiness_core::OrgId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // JSON logs unless READINESS_LOG_FORMAT=text.
    readiness_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();

    let org_id = cli
        .org_id
        .map(OrgId)
        .context("--org-id (or READINESS_ORG_ID) is required")?;
    let app = App::build(&cli).await?;

    let output = app.run(org_id, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
