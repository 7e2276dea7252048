use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

// `#[zbus::proxy]` generates `AttestProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "io.attest.Attest1",
    default_service = "io.attest.Attest1",
    default_path = "/io/attest/Attest1"
)]
trait Attest {
    async fn enroll(&self, user: &str, images: Vec<Vec<u8>>) -> zbus::Result<String>;
    async fn verify(&self, user: &str, task: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn forget(&self, user: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "attest", about = "Attest identity and task verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one or more photos of a user
    Enroll {
        #[arg(short, long)]
        user: String,
        /// JPEG or PNG files; duplicates are ignored by the daemon
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Verify a user performing a task in one proof photo
    Verify {
        #[arg(short, long)]
        user: String,
        /// Claimed task, e.g. "planting"
        #[arg(short, long)]
        task: String,
        image: PathBuf,
    },
    /// List enrolled users
    Users,
    /// Delete a user's enrollment
    Forget {
        #[arg(short, long)]
        user: String,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttestProxy::new(&conn)
        .await
        .context("creating attestd proxy")?;

    match cli.command {
        Commands::Enroll { user, images } => {
            let images = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            tracing::debug!(user = %user, count = images.len(), "sending enroll");
            print_json(&proxy.enroll(&user, images).await.context("Enroll call failed")?)?;
        }
        Commands::Verify { user, task, image } => {
            let image = read_image(&image)?;
            print_json(&proxy.verify(&user, &task, image).await.context("Verify call failed")?)?;
        }
        Commands::Users => {
            print_json(&proxy.list_users().await.context("ListUsers call failed")?)?;
        }
        Commands::Forget { user } => {
            if proxy.forget(&user).await.context("Forget call failed")? {
                println!("forgot {user}");
            } else {
                println!("{user} was not enrolled");
            }
        }
        Commands::Status => {
            print_json(&proxy.status().await.context("Status call failed")?)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply from the daemon.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify() {
        let cli = Cli::try_parse_from([
            "attest", "--system", "verify", "--user", "alice", "--task", "planting", "proof.jpg",
        ])
        .unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::Verify { user, task, image } => {
                assert_eq!(user, "alice");
                assert_eq!(task, "planting");
                assert_eq!(image, PathBuf::from("proof.jpg"));
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_enroll_requires_an_image() {
        assert!(Cli::try_parse_from(["attest", "enroll", "--user", "alice"]).is_err());
        let cli = Cli::try_parse_from(["attest", "enroll", "-u", "alice", "a.jpg", "b.png"]).unwrap();
        assert!(matches!(cli.command, Commands::Enroll { ref images, .. } if images.len() == 2));
    }
}
