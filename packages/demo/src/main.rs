use std::error::Error;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shigoto::{JobEvent, JobOptions, RunError, RunFuture, Runner, Shigoto, ShigotoConfig, Task};

#[derive(Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl Runner for Greet {
    fn run(&self) -> RunFuture<'_> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tracing::info!("hello, {}", self.name);
            Ok(())
        })
    }
}

impl Task for Greet {
    fn identify() -> Option<&'static str> {
        Some("greet")
    }

    fn default_queue(&self) -> Option<&str> {
        Some("greetings")
    }
}

/// Always fails, to show how run errors surface.
#[derive(Serialize, Deserialize)]
struct Grumble;

impl Runner for Grumble {
    fn run(&self) -> RunFuture<'_> {
        Box::pin(async { Err(RunError::from("not in the mood")) })
    }
}

impl Task for Grumble {
    fn default_queue(&self) -> Option<&str> {
        Some("greetings")
    }

    fn job_options(&self) -> JobOptions {
        JobOptions::default().with_max_run_time(Duration::from_secs(1))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ShigotoConfig::from_env()?;
    let shigoto = Shigoto::builder()
        .config(config)
        .register::<Greet>()
        .register::<Grumble>()
        .start()
        .await?;

    let mut events = shigoto.subscribe();
    shigoto.listen_queue("greetings", 2).await?;

    let names = ["Aiko", "Kenji", "Mei", "Sora"];
    for name in names {
        shigoto
            .queue(&Greet {
                name: name.to_string(),
            })
            .await?;
    }
    shigoto.queue(&Grumble).await?;

    let mut settled = 0;
    while settled < names.len() + 1 {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(event)) => {
                tracing::debug!("{}", event.description());
                if matches!(event, JobEvent::JobFinished { .. } | JobEvent::JobFailed { .. }) {
                    settled += 1;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "event stream interrupted");
                break;
            }
            Err(_) => {
                tracing::warn!("timed out waiting for jobs");
                break;
            }
        }
    }

    shigoto.close().await?;
    Ok(())
}
