use std::sync::Arc;

use aeth_channel::Listener;
use aeth_core::config::GUEST_AGENT_PORT;
use aeth_guest::{idle, secrets, server, ActivityClock, SecretStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let guest_ipv4 = std::env::var("AETHERIUM_GUEST_IPV4").unwrap_or_else(|_| "0.0.0.0".to_string());

    let store = Arc::new(SecretStore::empty());
    match secrets::fetch_from_host().await {
        Ok(fetched) => store.set_all(fetched),
        Err(e) => tracing::warn!(error = %e, "proceeding without host-provided secrets"),
    }

    let clock = Arc::new(ActivityClock::new());
    let idle_timeout = idle::default_idle_timeout();

    let listener = match Listener::bind(GUEST_AGENT_PORT, &guest_ipv4).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind guest agent listener");
            std::process::exit(1);
        }
    };

    let idle_clock = clock.clone();
    tokio::spawn(async move {
        idle::run(&idle_clock, idle_timeout, || {
            tracing::info!("powering off after idle timeout");
            unsafe { libc::reboot(libc::RB_POWER_OFF) };
        })
        .await;
    });

    server::serve(listener, store, clock).await;
}
