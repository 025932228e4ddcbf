//! `scanrun worker`: execute queued runs.

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use scanrun::run::worker::Worker;

use super::App;

pub async fn cmd_worker(app: App, burst: bool) -> Result<()> {
    let Some(queue) = app.queue.clone() else {
        bail!(
            "The worker needs async execution: set `async = true` under [execution], \
             SCANRUN_ASYNC=1 or pass --async"
        );
    };

    let App {
        config,
        db,
        service,
        dispatcher,
        notifications,
        ..
    } = app;

    let worker = Worker::new(db, queue, service).with_poll_interval(config.poll_interval());
    let shutdown = CancellationToken::new();
    let webhooks = tokio::spawn(dispatcher.run(notifications, shutdown.clone()));

    if burst {
        let processed = worker.run_burst().await?;
        println!("Processed {} job(s)", processed);
    } else {
        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                ctrl_c.cancel();
            }
        });
        worker.run(shutdown.clone()).await?;
    }

    // Let the dispatcher flush what the worker queued.
    drop(worker);
    shutdown.cancel();
    webhooks.await?;
    Ok(())
}
