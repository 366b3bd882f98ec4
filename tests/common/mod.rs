#![allow(dead_code)]

use analytics_gridsync::{
    bus::LocalBus,
    data::{Data, DataContext, DataHandle, DataOptions},
    events::{DataEvent, EventReceiver},
    sim::{SimulatedServer, SimulatorConfig},
    types::{CellBatch, Connection, Meta, SourceDescriptor},
};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub bus: Arc<LocalBus>,
    pub server: Arc<SimulatedServer>,
    pub context: DataContext,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn new(config: SimulatorConfig) -> Self {
        let bus = Arc::new(LocalBus::new());
        let server = SimulatedServer::new(bus.clone(), config);
        let task = server.start();
        let context = DataContext::new(server.clone(), bus.clone());
        Self {
            bus,
            server,
            context,
            task,
        }
    }

    pub fn grid(&self, label: &str) -> (DataHandle, EventReceiver<DataEvent>) {
        self.spawn(source(), DataOptions {
            bypass: false,
            label: label.to_string(),
        })
    }

    pub fn spawn(
        &self,
        source: SourceDescriptor,
        options: DataOptions,
    ) -> (DataHandle, EventReceiver<DataEvent>) {
        let data = Data::spawn(source, options, &self.context);
        let (_, events) = data.on();
        (data, events)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.context.shutdown();
        self.task.abort();
    }
}

pub fn source() -> SourceDescriptor {
    SourceDescriptor {
        view_definition: Some("Equity View".to_string()),
        ..Default::default()
    }
}

/// Next event matching `pred`, skipping the rest.
pub async fn wait_for(
    events: &mut EventReceiver<DataEvent>,
    mut pred: impl FnMut(&DataEvent) -> bool,
) -> DataEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_meta(events: &mut EventReceiver<DataEvent>) -> (Arc<Meta>, Connection) {
    match wait_for(events, |e| matches!(e, DataEvent::Meta { .. })).await {
        DataEvent::Meta { meta, connection } => (meta, connection),
        _ => unreachable!(),
    }
}

pub async fn wait_for_data(events: &mut EventReceiver<DataEvent>) -> Arc<CellBatch> {
    match wait_for(events, |e| matches!(e, DataEvent::Data(_))).await {
        DataEvent::Data(batch) => batch,
        _ => unreachable!(),
    }
}

/// Polls `check` while virtual time advances.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true")
}

/// Lets every pending task and timer run for `millis` of virtual time.
pub async fn settle(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Every event currently queued.
pub fn drain(events: &mut EventReceiver<DataEvent>) -> Vec<DataEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
