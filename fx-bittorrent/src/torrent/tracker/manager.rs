use crate::torrent::peer::PeerId;
use crate::torrent::tracker::{
    create_tracker_client, AnnounceEvent, AnnounceResponse, Announcement, Result, TrackerClient,
    TrackerError, TrackerHandle, DEFAULT_NUM_WANT,
};
use crate::torrent::{CompactPeer, InfoHash};
use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscription};
use log::{debug, info, trace, warn};
use std::cmp::min;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::time;
use tokio_util::sync::CancellationToken;
use url::Url;

/// The initial delay before retrying a failed announce.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(60);
/// The max delay before retrying a failed announce.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(20 * 60);
/// The min interval between periodic announces, regardless of the interval requested by the tracker.
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// The event that can be emitted by the tracker manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerManagerEvent {
    /// Invoked when new peers have been discovered
    PeersDiscovered(Vec<CompactPeer>),
    /// Invoked when a new tracker has been added
    TrackerAdded(TrackerHandle),
}

/// The transfer progress of the torrent which is shared with the trackers.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct TransferProgress {
    /// The number of bytes uploaded to peers
    pub uploaded: u64,
    /// The number of bytes downloaded from peers
    pub downloaded: u64,
    /// The number of bytes remaining to be downloaded
    pub left: u64,
}

/// The announce state of a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerInfo {
    /// The unique tracker handle
    pub handle: TrackerHandle,
    /// The announce url of the tracker
    pub url: Url,
    /// The time of the next scheduled announce
    pub next_announce: Option<Instant>,
    /// The number of seeders reported by the last announce
    pub seeders: u32,
    /// The number of leechers reported by the last announce
    pub leechers: u32,
}

/// Manages the trackers of a torrent and their periodic announcements.
///
/// Every tracker is announced to from its own loop, which starts with a `started` announce
/// and continues in the interval requested by the tracker. The peers returned by the trackers
/// are fanned in through the [TrackerManagerEvent::PeersDiscovered] event.
#[derive(Debug, Display)]
#[display("{}", inner)]
pub struct TrackerManager {
    inner: Arc<InnerTrackerManager>,
}

impl TrackerManager {
    /// Creates a new `TrackerManager` instance.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - The info hash of the torrent being tracked by this manager.
    /// * `peer_id` - The peer ID of the torrent session.
    /// * `port` - The port on which the torrent is listening for incoming peer connections.
    /// * `timeout` - The timeout of tracker requests.
    pub fn new(info_hash: InfoHash, peer_id: PeerId, port: u16, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(InnerTrackerManager {
                tag: info_hash.tag(),
                info_hash,
                peer_id,
                port,
                timeout,
                progress: Default::default(),
                trackers: Default::default(),
                started: Default::default(),
                completed: Default::default(),
                callbacks: MultiThreadedCallback::new(),
                cancellation_token: Default::default(),
            }),
        }
    }

    /// Get the announce state of the registered trackers.
    pub async fn trackers(&self) -> Vec<TrackerInfo> {
        self.inner
            .trackers
            .read()
            .await
            .iter()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Get the total number of registered trackers.
    pub async fn total_trackers(&self) -> usize {
        self.inner.trackers.read().await.len()
    }

    /// Check if the announce loops of the trackers have been started.
    pub async fn is_started(&self) -> bool {
        *self.inner.started.read().await
    }

    /// Add a new tracker for the given announce url.
    /// The tracker client is determined by the scheme of the url.
    ///
    /// # Returns
    ///
    /// Returns the handle of the new tracker, or the [TrackerError] when the url is invalid
    /// or already registered.
    pub async fn add_tracker(&self, url: Url) -> Result<TrackerHandle> {
        if self.inner.is_tracker_url_known(&url).await {
            return Err(TrackerError::DuplicateUrl(url));
        }

        let client = create_tracker_client(url, self.inner.timeout)?;
        self.add_client(client).await
    }

    /// Add the given tracker client to the manager.
    /// The announce loop of the tracker is started immediately when the manager has been started.
    pub async fn add_client(&self, client: Box<dyn TrackerClient>) -> Result<TrackerHandle> {
        let handle = TrackerHandle::new();
        let url = client.url().clone();
        let (sender, receiver) = unbounded_channel();

        {
            let mut trackers = self.inner.trackers.write().await;
            if trackers.iter().any(|e| e.info.url == url) {
                return Err(TrackerError::DuplicateUrl(url));
            }

            trackers.push(TrackerEntry {
                info: TrackerInfo {
                    handle,
                    url: url.clone(),
                    next_announce: None,
                    seeders: 0,
                    leechers: 0,
                },
                sender,
                pending: Some((client, receiver)),
            });
        }

        debug!("Tracker manager {} added tracker {} ({})", self, handle, url);
        self.inner
            .callbacks
            .invoke(TrackerManagerEvent::TrackerAdded(handle));
        if self.is_started().await {
            self.inner.spawn_announce_loops().await;
        }

        Ok(handle)
    }

    /// Update the transfer progress which is shared with the trackers on the next announce.
    pub async fn update_progress(&self, progress: TransferProgress) {
        trace!("Tracker manager {} is updating progress {:?}", self, progress);
        *self.inner.progress.write().await = progress;
    }

    /// Start announcing to the trackers.
    /// Every tracker starts with a `started` announcement.
    pub async fn start(&self) {
        {
            let mut started = self.inner.started.write().await;
            if *started {
                return;
            }
            *started = true;
        }

        debug!("Tracker manager {} is starting the announce loops", self);
        self.inner.spawn_announce_loops().await;
    }

    /// Inform the trackers that the torrent has completed.
    /// The `completed` announce is only sent once during the lifetime of the manager.
    pub async fn completed(&self) {
        {
            let mut completed = self.inner.completed.write().await;
            if *completed {
                return;
            }
            *completed = true;
        }

        info!("Tracker manager {} is announcing completion", self);
        self.inner.send_event(AnnounceEvent::Completed).await;
    }

    /// Stop announcing to the trackers.
    /// Every tracker which has been announced to receives a `stopped` announce.
    pub async fn stop(&self) {
        {
            let mut started = self.inner.started.write().await;
            if !*started {
                return;
            }
            *started = false;
        }

        debug!("Tracker manager {} is stopping the announce loops", self);
        self.inner.send_event(AnnounceEvent::Stopped).await;
    }
}

impl Callback<TrackerManagerEvent> for TrackerManager {
    fn subscribe(&self) -> Subscription<TrackerManagerEvent> {
        self.inner.callbacks.subscribe()
    }
}

impl Drop for TrackerManager {
    fn drop(&mut self) {
        trace!("Dropping tracker manager {}", self.inner);
        self.inner.cancellation_token.cancel();
    }
}

#[derive(Debug)]
struct TrackerEntry {
    info: TrackerInfo,
    sender: UnboundedSender<AnnounceEvent>,
    /// The client and event receiver of a tracker of which the announce loop hasn't started yet
    pending: Option<(Box<dyn TrackerClient>, UnboundedReceiver<AnnounceEvent>)>,
}

#[derive(Debug, Display)]
#[display("{}", tag)]
struct InnerTrackerManager {
    tag: String,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    timeout: Duration,
    progress: RwLock<TransferProgress>,
    trackers: RwLock<Vec<TrackerEntry>>,
    started: RwLock<bool>,
    completed: RwLock<bool>,
    callbacks: MultiThreadedCallback<TrackerManagerEvent>,
    cancellation_token: CancellationToken,
}

impl InnerTrackerManager {
    async fn is_tracker_url_known(&self, url: &Url) -> bool {
        self.trackers.read().await.iter().any(|e| &e.info.url == url)
    }

    async fn spawn_announce_loops(self: &Arc<Self>) {
        let mut trackers = self.trackers.write().await;

        for entry in trackers.iter_mut() {
            if let Some((client, receiver)) = entry.pending.take() {
                let announce_loop = AnnounceLoop {
                    handle: entry.info.handle,
                    client,
                    receiver,
                    schedule: AnnounceSchedule::new(Instant::now()),
                    inner: self.clone(),
                };
                tokio::spawn(announce_loop.run());
            }
        }
    }

    async fn send_event(&self, event: AnnounceEvent) {
        for entry in self.trackers.read().await.iter() {
            if entry.pending.is_none() {
                let _ = entry.sender.send(event);
            }
        }
    }

    async fn announcement(&self, event: AnnounceEvent) -> Announcement {
        let progress = *self.progress.read().await;

        Announcement {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
            num_want: DEFAULT_NUM_WANT,
        }
    }

    async fn update_info(
        &self,
        handle: TrackerHandle,
        schedule: &AnnounceSchedule,
        response: Option<&AnnounceResponse>,
    ) {
        let mut trackers = self.trackers.write().await;
        if let Some(entry) = trackers.iter_mut().find(|e| e.info.handle == handle) {
            entry.info.next_announce = Some(schedule.next_announce);
            if let Some(response) = response {
                entry.info.seeders = response.seeders;
                entry.info.leechers = response.leechers;
            }
        }
    }
}

/// The announce schedule of a single tracker.
#[derive(Debug, Clone, PartialEq)]
struct AnnounceSchedule {
    /// The event of the next periodic announce
    event: AnnounceEvent,
    next_announce: Instant,
    retry_delay: Option<Duration>,
    /// Indicates if the tracker has accepted at least one announce
    announced: bool,
}

impl AnnounceSchedule {
    fn new(now: Instant) -> Self {
        Self {
            event: AnnounceEvent::Started,
            next_announce: now,
            retry_delay: None,
            announced: false,
        }
    }

    /// Handle a successful announce of the given event.
    fn on_success(&mut self, event: AnnounceEvent, interval: Duration, now: Instant) {
        if event == self.event {
            self.event = AnnounceEvent::None;
        }
        self.announced = true;
        self.retry_delay = None;
        self.next_announce = now + interval.max(MIN_ANNOUNCE_INTERVAL);
    }

    /// Handle a failed announce of the given event.
    /// The delay before the next attempt is doubled on each consecutive failure.
    fn on_failure(&mut self, event: AnnounceEvent, now: Instant) {
        if event == AnnounceEvent::Completed {
            self.event = AnnounceEvent::Completed;
        }

        let delay = self
            .retry_delay
            .map(|e| min(e * 2, MAX_RETRY_DELAY))
            .unwrap_or(INITIAL_RETRY_DELAY);
        self.retry_delay = Some(delay);
        self.next_announce = now + delay;
    }
}

#[derive(Debug, Display)]
#[display("{}", handle)]
struct AnnounceLoop {
    handle: TrackerHandle,
    client: Box<dyn TrackerClient>,
    receiver: UnboundedReceiver<AnnounceEvent>,
    schedule: AnnounceSchedule,
    inner: Arc<InnerTrackerManager>,
}

impl AnnounceLoop {
    async fn run(mut self) {
        loop {
            let deadline = time::Instant::from_std(self.schedule.next_announce);

            select! {
                biased;
                event = self.receiver.recv() => match event {
                    Some(AnnounceEvent::Stopped) => {
                        if self.schedule.announced {
                            self.announce(AnnounceEvent::Stopped).await;
                        }
                        break;
                    }
                    Some(event) => self.announce(event).await,
                    None => break,
                },
                _ = self.inner.cancellation_token.cancelled() => break,
                _ = time::sleep_until(deadline) => {
                    let event = self.schedule.event;
                    self.announce(event).await;
                }
            }
        }

        debug!(
            "Tracker manager {} announce loop of {} ended",
            self.inner,
            self.client.url()
        );
    }

    async fn announce(&mut self, event: AnnounceEvent) {
        let announcement = self.inner.announcement(event).await;
        trace!(
            "Tracker manager {} is announcing {} to {}",
            self.inner,
            event,
            self.client.url()
        );

        // the stopped announce is bound by the request timeout instead of the manager lifetime
        let result = if event == AnnounceEvent::Stopped {
            time::timeout(self.inner.timeout, self.client.announce(announcement))
                .await
                .map_err(TrackerError::from)
                .and_then(|e| e)
        } else {
            select! {
                _ = self.inner.cancellation_token.cancelled() => return,
                result = self.client.announce(announcement) => result,
            }
        };

        let now = Instant::now();
        match result {
            Ok(response) => {
                debug!(
                    "Tracker manager {} received {} peers from {}, next announce in {}s",
                    self.inner,
                    response.peers.len(),
                    self.client.url(),
                    response.interval.as_secs()
                );
                self.schedule.on_success(event, response.interval, now);
                self.inner
                    .update_info(self.handle, &self.schedule, Some(&response))
                    .await;

                if !response.peers.is_empty() {
                    self.inner
                        .callbacks
                        .invoke(TrackerManagerEvent::PeersDiscovered(response.peers));
                }
            }
            Err(e) => {
                self.schedule.on_failure(event, now);
                warn!(
                    "Tracker manager {} failed to announce to {}, retrying in {}s, {}",
                    self.inner,
                    self.client.url(),
                    self.schedule
                        .retry_delay
                        .map(|e| e.as_secs())
                        .unwrap_or_default(),
                    e
                );
                self.inner.update_info(self.handle, &self.schedule, None).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use crate::torrent::tracker::TrackerClient;
    use async_trait::async_trait;
    use mockall::mock;
    use std::net::SocketAddr;
    use std::str::FromStr;

    mock! {
        #[derive(Debug)]
        pub TrackerClient {}

        #[async_trait]
        impl TrackerClient for TrackerClient {
            fn url(&self) -> &Url;
            async fn announce(&self, announcement: Announcement) -> Result<AnnounceResponse>;
        }
    }

    fn create_manager() -> TrackerManager {
        TrackerManager::new(
            InfoHash::from_str("EADAF0EFEA39406914414D359E0EA16416409BD7").unwrap(),
            PeerId::new(),
            6881,
            Duration::from_secs(1),
        )
    }

    fn create_response(interval: u64) -> AnnounceResponse {
        AnnounceResponse {
            interval: Duration::from_secs(interval),
            leechers: 2,
            seeders: 8,
            peers: vec![
                CompactPeer::from(SocketAddr::from(([127, 0, 0, 1], 6881))),
                CompactPeer::from(SocketAddr::from(([10, 0, 0, 2], 6882))),
            ],
        }
    }

    #[tokio::test]
    async fn test_start_announces_started() {
        init_logger!();
        let url = Url::parse("udp://localhost:6969").unwrap();
        let mut client = MockTrackerClient::new();
        client.expect_url().return_const(url);
        client
            .expect_announce()
            .withf(|announcement| announcement.event == AnnounceEvent::Started)
            .times(1)
            .returning(|_| Ok(create_response(1800)));
        let manager = create_manager();
        let mut receiver = manager.subscribe();

        manager.add_client(Box::new(client)).await.unwrap();
        manager.start().await;

        let mut peers = None;
        while peers.is_none() {
            let event = time::timeout(Duration::from_secs(1), receiver.recv())
                .await
                .expect("expected the peers to have been discovered")
                .unwrap();
            if let TrackerManagerEvent::PeersDiscovered(e) = &*event {
                peers = Some(e.clone());
            }
        }

        let peers = peers.unwrap();
        assert_eq!(2, peers.len(), "expected 2 peers to have been discovered");
        assert_eq!(6, peers[0].as_bytes().len());

        let trackers = manager.trackers().await;
        let next_announce = trackers[0]
            .next_announce
            .expect("expected the next announce to be scheduled");
        let remaining = next_announce.saturating_duration_since(Instant::now());
        assert!(
            remaining > Duration::from_secs(1790) && remaining <= Duration::from_secs(1800),
            "expected the next announce to be scheduled in ~1800s, got {}s",
            remaining.as_secs()
        );
        assert_eq!(8, trackers[0].seeders);
    }

    #[tokio::test]
    async fn test_add_tracker_duplicate_url() {
        init_logger!();
        let url = Url::parse("udp://localhost:6969").unwrap();
        let manager = create_manager();

        manager.add_tracker(url.clone()).await.unwrap();
        let result = manager.add_tracker(url.clone()).await;

        assert_eq!(Err(TrackerError::DuplicateUrl(url)), result);
        assert_eq!(1, manager.total_trackers().await);
    }

    #[tokio::test]
    async fn test_add_tracker_unsupported_scheme() {
        init_logger!();
        let url = Url::parse("wss://localhost:6969").unwrap();
        let manager = create_manager();

        let result = manager.add_tracker(url).await;

        assert_eq!(
            Err(TrackerError::UnsupportedScheme("wss".to_string())),
            result
        );
    }

    #[tokio::test]
    async fn test_stop_announces_stopped() {
        init_logger!();
        let url = Url::parse("udp://localhost:6969").unwrap();
        let (tx, mut rx) = unbounded_channel();
        let mut client = MockTrackerClient::new();
        client.expect_url().return_const(url);
        client.expect_announce().returning(move |announcement| {
            tx.send(announcement.event).unwrap();
            Ok(create_response(1800))
        });
        let manager = create_manager();
        manager.add_client(Box::new(client)).await.unwrap();

        manager.start().await;
        let result = crate::recv_timeout!(&mut rx, Duration::from_secs(1));
        assert_eq!(AnnounceEvent::Started, result);

        manager.completed().await;
        manager.completed().await;
        let result = crate::recv_timeout!(&mut rx, Duration::from_secs(1));
        assert_eq!(AnnounceEvent::Completed, result);

        manager.stop().await;
        let result = crate::recv_timeout!(&mut rx, Duration::from_secs(1));
        assert_eq!(
            AnnounceEvent::Stopped,
            result,
            "expected completed to have been announced only once"
        );
    }

    #[test]
    fn test_announce_schedule_on_success() {
        let now = Instant::now();
        let mut schedule = AnnounceSchedule::new(now);

        schedule.on_success(AnnounceEvent::Started, Duration::from_secs(1800), now);

        assert_eq!(AnnounceEvent::None, schedule.event);
        assert_eq!(now + Duration::from_secs(1800), schedule.next_announce);
        assert_eq!(true, schedule.announced);
    }

    #[test]
    fn test_announce_schedule_on_success_zero_interval() {
        let now = Instant::now();
        let mut schedule = AnnounceSchedule::new(now);

        schedule.on_success(AnnounceEvent::Started, Duration::ZERO, now);

        assert_eq!(
            now + MIN_ANNOUNCE_INTERVAL,
            schedule.next_announce,
            "expected the tracker interval to be bounded"
        );
    }

    #[test]
    fn test_announce_schedule_on_failure() {
        let now = Instant::now();
        let mut schedule = AnnounceSchedule::new(now);

        schedule.on_failure(AnnounceEvent::Started, now);
        assert_eq!(AnnounceEvent::Started, schedule.event, "expected started to be retried");
        assert_eq!(now + Duration::from_secs(60), schedule.next_announce);

        schedule.on_failure(AnnounceEvent::Started, now);
        assert_eq!(now + Duration::from_secs(120), schedule.next_announce);

        for _ in 0..10 {
            schedule.on_failure(AnnounceEvent::Started, now);
        }
        assert_eq!(now + MAX_RETRY_DELAY, schedule.next_announce);

        schedule.on_success(AnnounceEvent::Started, Duration::from_secs(900), now);
        schedule.on_failure(AnnounceEvent::None, now);
        assert_eq!(
            now + Duration::from_secs(60),
            schedule.next_announce,
            "expected the retry delay to have been reset"
        );
    }

    #[test]
    fn test_announce_schedule_completed_failure() {
        let now = Instant::now();
        let mut schedule = AnnounceSchedule::new(now);
        schedule.on_success(AnnounceEvent::Started, Duration::from_secs(1800), now);

        schedule.on_failure(AnnounceEvent::Completed, now);
        assert_eq!(AnnounceEvent::Completed, schedule.event);

        schedule.on_success(AnnounceEvent::Completed, Duration::from_secs(1800), now);
        assert_eq!(AnnounceEvent::None, schedule.event);
    }
}
