/// Volume event watcher
///
/// One long-lived `docker events` subscription for the lifetime of the
/// service. Parsed events are published on a broadcast channel; a consumer
/// task turns them into cache invalidations. When the stream ends or fails it
/// is reopened after an exponential backoff.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::core::error::{VolumeError, VolumeResult};
use crate::core::executor::DockerCli;
use crate::core::inventory::InventoryReader;
use crate::core::size::SizeCache;
use crate::utils::constants::{EVENT_CHANNEL_CAPACITY, WATCHED_EVENT_ACTIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeAction {
    Create,
    Destroy,
    Mount,
    Unmount,
}

impl VolumeAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(VolumeAction::Create),
            "destroy" => Some(VolumeAction::Destroy),
            "mount" => Some(VolumeAction::Mount),
            "unmount" => Some(VolumeAction::Unmount),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeEvent {
    pub action: VolumeAction,
    pub volume: String,
    /// Container ID for mount and unmount
    pub container: Option<String>,
    /// Mounted without write access, so contents cannot change
    pub read_only: bool,
    pub time: Option<i64>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: RawActor,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Deserialize, Default)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Parse one line of `docker events --format '{{json .}}'`.
///
/// Returns `Ok(None)` for events that do not concern volume contents.
pub fn parse_event(line: &str) -> VolumeResult<Option<VolumeEvent>> {
    let raw: RawEvent = serde_json::from_str(line)
        .map_err(|e| VolumeError::Parse(format!("bad event line {:?}: {}", line, e)))?;

    if !raw.kind.is_empty() && raw.kind != "volume" {
        return Ok(None);
    }
    let action = match VolumeAction::parse(&raw.action) {
        Some(action) => action,
        None => return Ok(None),
    };
    if raw.actor.id.is_empty() {
        return Err(VolumeError::Parse(format!("event without volume: {:?}", line)));
    }

    Ok(Some(VolumeEvent {
        action,
        volume: raw.actor.id,
        container: raw.actor.attributes.get("container").cloned(),
        read_only: raw
            .actor
            .attributes
            .get("read/write")
            .map(|rw| rw == "false")
            .unwrap_or(false),
        time: raw.time,
    }))
}

/// Apply one event to the cached state
pub fn apply_event(event: &VolumeEvent, sizes: &SizeCache, inventory: &InventoryReader) {
    inventory.invalidate();
    match event.action {
        VolumeAction::Destroy => sizes.forget(&event.volume),
        // Read-only mounts include our own size measurements
        VolumeAction::Mount | VolumeAction::Unmount if !event.read_only => {
            sizes.invalidate(&event.volume)
        }
        _ => {}
    }
}

fn events_args() -> Vec<String> {
    let mut args = vec![
        "events".to_string(),
        "--filter".to_string(),
        "type=volume".to_string(),
    ];
    for action in WATCHED_EVENT_ACTIONS {
        args.push("--filter".to_string());
        args.push(format!("event={}", action));
    }
    args.push("--format".to_string());
    args.push("{{json .}}".to_string());
    args
}

pub struct EventWatcher {
    cli: DockerCli,
    backoff_initial: Duration,
    backoff_max: Duration,
    sender: broadcast::Sender<VolumeEvent>,
}

impl EventWatcher {
    pub fn new(cli: DockerCli, backoff_initial: Duration, backoff_max: Duration) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cli,
            backoff_initial,
            backoff_max: backoff_max.max(backoff_initial),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<VolumeEvent> {
        self.sender.clone()
    }

    /// Keep a subscription open forever
    pub async fn run(self) {
        let mut delay = self.backoff_initial;

        loop {
            match self.session().await {
                Ok((delivered, exit)) => {
                    warn!(
                        "volume event stream closed (exit code {:?}) after {} events",
                        exit, delivered
                    );
                    if delivered > 0 {
                        delay = self.backoff_initial;
                    }
                }
                Err(e) => warn!("volume event stream failed: {}", e),
            }

            debug!("resubscribing to volume events in {:?}", delay);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.backoff_max);
        }
    }

    /// One subscription; returns the number of events published and the exit code
    async fn session(&self) -> VolumeResult<(usize, Option<i32>)> {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let args = events_args();
        let stream = self.cli.stream(&args, tx);
        tokio::pin!(stream);

        info!("subscribed to volume events");
        let mut delivered = 0;
        let exit = loop {
            tokio::select! {
                exit = &mut stream => break exit?,
                Some(line) = rx.recv() => {
                    if self.publish(&line) {
                        delivered += 1;
                    }
                }
            }
        };

        // Lines buffered before the process exited
        while let Ok(line) = rx.try_recv() {
            if self.publish(&line) {
                delivered += 1;
            }
        }

        Ok((delivered, exit))
    }

    fn publish(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        match parse_event(line) {
            Ok(Some(event)) => {
                debug!("volume event: {:?} {}", event.action, event.volume);
                // No receivers is fine, nobody is listening yet
                let _ = self.sender.send(event);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}

/// Consume events and invalidate sizes and inventory until the channel closes
pub async fn invalidate_on_events(
    mut events: broadcast::Receiver<VolumeEvent>,
    sizes: Arc<crate::core::size::SizeCalculator>,
    inventory: Arc<InventoryReader>,
) {
    loop {
        match events.recv().await {
            Ok(event) => apply_event(&event, sizes.cache(), &inventory),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("missed {} volume events, dropping all cached state", missed);
                sizes.cache().invalidate_all();
                inventory.invalidate();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::size::SizeCalculator;
    use crate::core::testing::ScriptedRuntime;

    const MOUNT_RW: &str = r#"{"status":"mount","id":"data1","Type":"volume","Action":"mount","Actor":{"ID":"data1","Attributes":{"container":"4f3e","destination":"/data","driver":"local","propagation":"","read/write":"true"}},"scope":"local","time":1700000000,"timeNano":1700000000000000000}"#;
    const MOUNT_RO: &str = r#"{"Type":"volume","Action":"mount","Actor":{"ID":"data1","Attributes":{"container":"77aa","read/write":"false"}},"time":1700000001}"#;
    const DESTROY: &str = r#"{"Type":"volume","Action":"destroy","Actor":{"ID":"old","Attributes":{"driver":"local"}},"time":1700000002}"#;
    const CREATE: &str = r#"{"Type":"volume","Action":"create","Actor":{"ID":"fresh","Attributes":{"driver":"local"}},"time":1700000003}"#;

    #[test]
    fn test_parse_mount_event() {
        let event = parse_event(MOUNT_RW).unwrap().unwrap();
        assert_eq!(event.action, VolumeAction::Mount);
        assert_eq!(event.volume, "data1");
        assert_eq!(event.container.as_deref(), Some("4f3e"));
        assert!(!event.read_only);
        assert_eq!(event.time, Some(1700000000));

        assert!(parse_event(MOUNT_RO).unwrap().unwrap().read_only);
    }

    #[test]
    fn test_parse_ignores_other_events() {
        let prune = r#"{"Type":"volume","Action":"prune","Actor":{"ID":"","Attributes":{}}}"#;
        assert!(parse_event(prune).unwrap().is_none());
        let container = r#"{"Type":"container","Action":"create","Actor":{"ID":"abc"}}"#;
        assert!(parse_event(container).unwrap().is_none());
        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn test_events_args_filter_server_side() {
        let args = events_args();
        assert_eq!(args[0], "events");
        assert!(args.contains(&"type=volume".to_string()));
        assert!(args.contains(&"event=unmount".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("{{json .}}"));
    }

    #[tokio::test]
    async fn test_apply_event_invalidation() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let cli = runtime.cli();
        let sizes = SizeCalculator::new(cli.clone(), "busybox");
        let inventory = InventoryReader::new(cli);
        runtime.add_volume("data1", 10);
        runtime.add_volume("old", 20);
        sizes.calculate_size("data1").await.unwrap();
        sizes.calculate_size("old").await.unwrap();

        apply_event(&parse_event(MOUNT_RO).unwrap().unwrap(), sizes.cache(), &inventory);
        assert!(sizes.cache().peek("data1").is_some());

        apply_event(&parse_event(MOUNT_RW).unwrap().unwrap(), sizes.cache(), &inventory);
        assert!(sizes.cache().peek("data1").is_none());

        apply_event(&parse_event(DESTROY).unwrap().unwrap(), sizes.cache(), &inventory);
        assert!(sizes.cache().peek("old").is_none());
    }

    #[tokio::test]
    async fn test_watcher_reconnects_and_publishes() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_event_session(&[CREATE, "garbage", MOUNT_RW]);
        runtime.push_event_session(&[DESTROY]);

        let watcher = EventWatcher::new(
            runtime.cli(),
            Duration::from_millis(1),
            Duration::from_millis(5),
        );
        let mut events = watcher.subscribe();
        let task = tokio::spawn(watcher.run());

        let mut received = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            received.push((event.action, event.volume));
        }

        assert_eq!(
            received,
            vec![
                (VolumeAction::Create, "fresh".to_string()),
                (VolumeAction::Mount, "data1".to_string()),
                (VolumeAction::Destroy, "old".to_string()),
            ]
        );

        // Third subscription stays open
        tokio::time::timeout(Duration::from_secs(5), async {
            while runtime.stream_sessions() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        task.abort();
    }
}
