mod cli;

use anyhow::Result;
use arbor::commands::{self, new::NewArgs};
use arbor::lifecycle::ShipOptions;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let (orch, current) = commands::build_context()?;
    let mut stdout = std::io::stdout();
    let mut stdin = std::io::stdin().lock();

    match cli.command {
        Command::New {
            branch,
            ticket,
            title,
            existing,
        } => {
            commands::new::new(
                &orch,
                NewArgs {
                    branch,
                    ticket,
                    title,
                    existing,
                },
                &mut stdout,
            )
            .await?;
        }
        Command::List => commands::list::list(&orch, &mut stdout)?,
        Command::Issues {
            create,
            team,
            priority,
        } => {
            commands::issues::issues(
                &orch,
                commands::issues::IssueArgs {
                    create,
                    team,
                    priority,
                },
                &mut stdout,
            )
            .await?;
        }
        Command::Shelve { branch, yes } => {
            commands::cleanup::shelve(&orch, &branch, yes, &mut stdin, &mut stdout).await?;
        }
        Command::Resume { branch } => {
            commands::cleanup::resume(&orch, &branch, &mut stdout).await?;
        }
        Command::Update { branch, merge } => {
            let branch = commands::resolve_branch(branch, current.as_ref())?;
            commands::update::update(&orch, &branch, merge, &mut stdout).await?;
        }
        Command::Ship {
            branch,
            force,
            auto_merge,
            no_ai,
        } => {
            let branch = commands::resolve_branch(branch, current.as_ref())?;
            commands::ship::ship(
                &orch,
                &branch,
                ShipOptions {
                    force,
                    auto_merge,
                    use_ai: !no_ai,
                },
                &mut stdout,
            )
            .await?;
        }
        Command::Cleanup { branch, yes } => {
            let branch = commands::resolve_branch(branch, current.as_ref())?;
            commands::cleanup::cleanup(&orch, &branch, yes, &mut stdin, &mut stdout).await?;
        }
        Command::Cancel { branch, yes } => {
            let branch = commands::resolve_branch(branch, current.as_ref())?;
            commands::cleanup::cancel(&orch, &branch, yes, &mut stdin, &mut stdout).await?;
        }
        Command::Prune => commands::prune::prune(&orch, &mut stdout).await?,
        Command::Status => {
            commands::status::status(&orch, current.as_ref(), &mut stdout).await?;
        }
        Command::Watch => commands::watch::watch(&orch, &mut stdout).await?,
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ARBOR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
