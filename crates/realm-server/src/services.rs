//! Background services selectable by id in configuration.

use std::sync::Arc;
use std::time::Duration;

use realm_core::{task_fn, Affinity, Flow, RecurringTask, Registry, Tick};
use tracing::{debug, info};

use crate::context::Realm;
use crate::metrics;

/// How often lane counters are published.
const LANE_STATS_PERIOD: Duration = Duration::from_secs(10);

/// Pulses between tick registry prunes.
const TICK_PRUNE_PULSES: u32 = 100;

/// A buildable background service.
pub enum Service {
    /// A recurring task on its own lane and period.
    Task(RecurringTask),
    /// A tick on the strict lane at the simulation pulse.
    Tick { name: String, tick: Tick },
}

/// Every service a configuration may name.
#[must_use]
pub fn registry() -> Registry<Arc<Realm>, Service> {
    Registry::new()
        .register("lane-stats", |realm: &Arc<Realm>| {
            let executor = Arc::downgrade(&realm.executor);
            let task = task_fn(move || {
                let Some(executor) = executor.upgrade() else {
                    return Ok(Flow::Stop);
                };
                metrics::record_lanes(&executor.stats());
                Ok(Flow::Continue)
            });
            Ok(Service::Task(RecurringTask::new(
                "lane-stats",
                Affinity::Service,
                LANE_STATS_PERIOD,
                task,
            )))
        })
        .register("tick-prune", |realm: &Arc<Realm>| {
            let ticks = Arc::downgrade(&realm.ticks);
            let tick = Tick::persistent(TICK_PRUNE_PULSES, move || {
                let Some(ticks) = ticks.upgrade() else {
                    return Ok(false);
                };
                let live = ticks.prune();
                debug!(live, "Pruned tick registry");
                Ok(true)
            })
            .with_identifier("tick-prune")?;
            Ok(Service::Tick {
                name: "tick-prune".to_string(),
                tick,
            })
        })
        .register("pulse-counter", |_realm: &Arc<Realm>| {
            let tick = Tick::strict(1, || {
                metrics::record_pulse();
                Ok(true)
            });
            Ok(Service::Tick {
                name: "pulse-counter".to_string(),
                tick,
            })
        })
}

/// Build and schedule the configured services.
///
/// # Errors
///
/// Fails on the first unknown id, failing factory or identifier clash.
pub fn install(realm: &Arc<Realm>) -> anyhow::Result<Vec<String>> {
    let services = registry().build_all(&realm.config.services, realm)?;
    let mut installed = Vec::with_capacity(services.len());

    for service in services {
        match service {
            Service::Task(task) => {
                let handle = realm.executor.submit(task);
                installed.push(handle.name().to_string());
            }
            Service::Tick { name, tick } => {
                let handle = realm.executor.schedule_tick(name.clone(), tick);
                if handle.identifier().is_some() {
                    realm.ticks.register(handle)?;
                }
                installed.push(name);
            }
        }
    }

    info!(services = ?installed, "Services installed");
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use realm_core::RegistryError;

    fn realm(services: &[&str]) -> Arc<Realm> {
        let config = Config {
            services: services.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        };
        Realm::on_runtime(tokio::runtime::Handle::current(), config)
    }

    #[test]
    fn test_registry_ids() {
        let ids: Vec<_> = registry().ids().collect();
        assert_eq!(ids, vec!["lane-stats", "pulse-counter", "tick-prune"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_registers_identified_ticks() {
        let realm = realm(&["lane-stats", "tick-prune"]);
        let installed = install(&realm).unwrap();
        assert_eq!(installed, vec!["lane-stats", "tick-prune"]);
        assert!(realm.ticks.get("tick-prune").is_some());
        realm.finish_shutdown();
    }

    #[tokio::test]
    async fn test_unknown_service_rejected() {
        let realm = realm(&["lane-stats", "reflection"]);
        let err = registry()
            .build_all(&realm.config.services, &realm)
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Unknown { ref id, .. } if id == "reflection"));
        assert!(install(&realm).is_err());
    }
}
