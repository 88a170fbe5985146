// Broker daemon entry point.
mod observability;

use anyhow::{Context, Result};
use broker::{config, relay};
use pylon_broker::{Acceptor, SessionRegistry};
use pylon_wire::BytesCodec;
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("pylon-broker")?;
    let config = config::ServiceConfig::from_env_or_yaml()?;

    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let registry = SessionRegistry::new(BytesCodec);
    let _relay = if config.relay {
        Some(relay::install(&registry))
    } else {
        tracing::info!("relay disabled (PYLON_BROKER_RELAY=false)");
        None
    };

    let acceptor = Acceptor::bind(config.bind, config.broker.clone(), registry)
        .await
        .context("bind broker listener")?;
    acceptor.spawn()?;
    tracing::info!(addr = %acceptor.local_addr(), relay = config.relay, "broker started");

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    acceptor.stop();
    acceptor.join().await?;
    metrics_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // Restores every variable it touched, newest first, when dropped.
    #[derive(Default)]
    struct ScopedEnv {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl ScopedEnv {
        fn set(mut self, key: &'static str, value: &str) -> Self {
            self.saved.push((key, std::env::var(key).ok()));
            unsafe { std::env::set_var(key, value) };
            self
        }

        fn unset(mut self, key: &'static str) -> Self {
            self.saved.push((key, std::env::var(key).ok()));
            unsafe { std::env::remove_var(key) };
            self
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            for (key, prev) in self.saved.drain(..).rev() {
                match prev {
                    Some(value) => unsafe { std::env::set_var(key, value) },
                    None => unsafe { std::env::remove_var(key) },
                }
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_with_relay() -> Result<()> {
        let _env = ScopedEnv::default()
            .set("PYLON_BROKER_BIND", "127.0.0.1:0")
            .set("PYLON_BROKER_METRICS_BIND", "127.0.0.1:0")
            .unset("PYLON_BROKER_RELAY")
            .unset("PYLON_BROKER_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_without_relay() -> Result<()> {
        let _env = ScopedEnv::default()
            .set("PYLON_BROKER_BIND", "127.0.0.1:0")
            .set("PYLON_BROKER_METRICS_BIND", "127.0.0.1:0")
            .set("PYLON_BROKER_RELAY", "false")
            .unset("PYLON_BROKER_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_rejects_bad_bind() {
        let _env = ScopedEnv::default()
            .set("PYLON_BROKER_BIND", "nope")
            .unset("PYLON_BROKER_CONFIG");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
