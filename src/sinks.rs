//! The bundled observers.

use std::sync::Arc;

use crate::config::Options;
use crate::deliver::{self, DeliveryJob, DeliveryWorker};
use crate::error::Error;
use crate::flatten::{EdgeRecord, Flattener};
use crate::observer::{Console, Observer, ObserverKind, Subject};
use crate::store::Store;

/// Prints identity and response time of each call.
#[derive(Debug, Clone)]
pub struct PrintSink {
    console: Console,
}

impl PrintSink {
    pub fn new(console: Console) -> Self {
        Self { console }
    }

    pub fn render(subject: &Subject<'_>) -> String {
        let id = subject.identity;
        format!(
            "PrintSink\n \
             ├─ method_name={}\n \
             ├─ test_id={}\n \
             ├─ sample_id={}\n \
             ├─ test_case_name={}\n \
             ├─ database_name={}\n \
             └─ total_response_time={:.6}s\n",
            subject.method_name(),
            id.test_id,
            id.sample_id,
            id.test_case_name,
            id.database_name,
            subject.profile.total_response_time.as_secs_f64(),
        )
    }
}

impl Observer for PrintSink {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Print
    }

    fn update(&self, subject: &Subject<'_>) -> Result<(), Error> {
        self.console.write_str(&Self::render(subject))?;
        Ok(())
    }
}

/// Flattens each call graph and ships the records to a store.
pub struct StatisticsSink {
    store: Option<Arc<dyn Store>>,
    /// Present when delivery is asynchronous.
    worker: Option<Arc<DeliveryWorker>>,
}

impl StatisticsSink {
    /// With asynchronous delivery enabled, records go through `worker`, or a
    /// worker of the sink's own when none is shared. If that cannot be
    /// spawned the sink delivers synchronously.
    pub fn new(
        store: Option<Arc<dyn Store>>,
        options: &Options,
        worker: Option<Arc<DeliveryWorker>>,
    ) -> Self {
        let worker = if options.enable_asynchronous_payload_delivery {
            worker.or_else(|| match DeliveryWorker::spawn(options.delivery_queue_capacity) {
                Ok(worker) => Some(Arc::new(worker)),
                Err(e) => {
                    tracing::warn!(error = %e, "cannot start delivery worker, delivering synchronously");
                    None
                }
            })
        } else {
            None
        };
        Self { store, worker }
    }

    pub fn is_asynchronous(&self) -> bool {
        self.worker.is_some()
    }

    /// Worker used for asynchronous delivery, if any.
    pub fn worker(&self) -> Option<&Arc<DeliveryWorker>> {
        self.worker.as_ref()
    }
}

impl Observer for StatisticsSink {
    fn kind(&self) -> ObserverKind {
        ObserverKind::Statistics
    }

    fn update(&self, subject: &Subject<'_>) -> Result<(), Error> {
        let store = self.store.as_ref().ok_or_else(|| Error::InvalidObserver {
            kind: ObserverKind::Statistics,
            reason: "no statistics store is bound".into(),
        })?;
        let binding = store.resolve(&subject.identity.database_name)?;

        let flattener = Flattener::new(
            subject.identity,
            subject.method_name(),
            subject.profile.total_response_time,
        );
        let records: Vec<EdgeRecord> = flattener.flatten(&subject.profile.call_graph).collect();

        match &self.worker {
            Some(worker) => {
                worker.submit(DeliveryJob {
                    store: Arc::clone(store),
                    binding,
                    records,
                });
                Ok(())
            }
            None => deliver::deliver(store.as_ref(), &binding, records).map(|_| ()),
        }
    }
}

impl std::fmt::Debug for StatisticsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsSink")
            .field("store", &self.store.is_some())
            .field("worker", &self.worker)
            .finish()
    }
}
