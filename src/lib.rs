//! SIP message processing core for an IMS signalling node acting as a
//! stateful proxy and registrar. This crate exposes the worker dispatch
//! engine, the application-server framework services plug into, and the
//! CAS-protected registration store; wire transports and the transaction
//! engine attach through the seams in [`sip`] and [`dispatch`].

pub mod appserver;
mod builder;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod registration;
pub mod sip;

pub use builder::{CoreHandle, CoreRuntime, SipCoreBuilder};
pub use config::{CoreConfig, DispatchConfig, RegistrarConfig};
pub use error::{Error, Result};
pub use sip::{Registrar, SipPipeline, TrailId};

#[cfg(test)]
mod tests {
    use super::config::{CoreConfig, DispatchConfig, RegistrarConfig};
    use super::registration::{MemoryStore, RegistrationStore};
    use super::sip::testutil::register_request;
    use super::sip::{Registrar, TrailId};
    use super::SipCoreBuilder;
    use crate::dispatch::RxMessage;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn register_through_a_running_core() {
        let config = CoreConfig {
            home_domain: "example.com".to_string(),
            dispatch: DispatchConfig {
                num_worker_threads: 2,
                ..DispatchConfig::default()
            },
            registrar: RegistrarConfig::default(),
        };

        let store = Arc::new(RegistrationStore::new(Arc::new(MemoryStore::new())));
        let registrar = Arc::new(Registrar::new(store.clone(), config.registrar.clone()));

        let runtime = SipCoreBuilder::new(config)
            .register_service(registrar)
            .build()
            .expect("build runtime");
        let handle = runtime.start().expect("start core");

        let rx = RxMessage {
            msg: register_request("sip:alice@example.com", "sip:alice@1.2.3.4", 3600).into(),
            trail: TrailId(1),
        };
        handle.ingress().on_rx_message(&rx);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let aor = store.get_aor("sip:alice@example.com").expect("read aor");
            if aor.binding_count() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "registration not applied in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await.expect("shutdown core");
    }

    #[test]
    fn build_rejects_a_workerless_pool() {
        let config = CoreConfig {
            home_domain: "example.com".to_string(),
            dispatch: DispatchConfig {
                num_worker_threads: 0,
                ..DispatchConfig::default()
            },
            registrar: RegistrarConfig::default(),
        };
        assert!(SipCoreBuilder::new(config).build().is_err());
    }
}
