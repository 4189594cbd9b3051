use cardq_core::{
    BlockQueue, CardHost, CardQueue, CardStatus, Direction, HostLimits, IssueContext, Outcome,
    QueueConfig, QueueError, Request, SgSource, WorkerState,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Issued {
    sector: u64,
    direction: Direction,
    sg_len: usize,
    sources: Vec<SgSource>,
    lens: Vec<usize>,
    data: Vec<u8>,
    /// `before_request` calls seen when this request was issued.
    prepared: usize,
}

#[derive(Default)]
struct HostState {
    issued: Vec<Issued>,
    fail_reads: bool,
    /// Scripted results for upcoming status queries; empty means ready.
    statuses: VecDeque<io::Result<CardStatus>>,
    status_queries: usize,
}

/// Host that records every issued request and fills reads with a pattern.
#[derive(Clone, Default)]
struct MockHost {
    state: Arc<Mutex<HostState>>,
    removals: Arc<AtomicUsize>,
    before_requests: Arc<AtomicUsize>,
    /// When set, `issue` reports entry and then blocks until released.
    hold: Option<Arc<Hold>>,
}

struct Hold {
    entered: Mutex<mpsc::Sender<u64>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl MockHost {
    fn holding() -> (Self, mpsc::Receiver<u64>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let host = Self {
            hold: Some(Arc::new(Hold {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            })),
            ..Self::default()
        };
        (host, entered_rx, release_tx)
    }

    fn issued(&self) -> Vec<Issued> {
        self.state.lock().unwrap().issued.clone()
    }
}

fn read_pattern(sector: u64, offset: usize) -> u8 {
    (sector as usize * 31 + offset) as u8
}

impl CardHost for MockHost {
    fn issue(&mut self, io: &mut IssueContext<'_>) -> io::Result<()> {
        if let Some(hold) = &self.hold {
            hold.entered.lock().unwrap().send(io.sector()).unwrap();
            hold.release.lock().unwrap().recv_timeout(TIMEOUT).unwrap();
        }

        let sg_len = io.map_segments();
        let entries = io.sg().entries().to_vec();
        let mut data = Vec::new();
        let fail = io.direction() == Direction::Read && self.state.lock().unwrap().fail_reads;
        match io.direction() {
            Direction::Write => {
                for i in 0..sg_len {
                    data.extend_from_slice(io.segment(i));
                }
            }
            Direction::Read => {
                let sector = io.sector();
                let mut offset = 0;
                for i in 0..sg_len {
                    for byte in io.segment_mut(i) {
                        *byte = if fail { 0xee } else { read_pattern(sector, offset) };
                        offset += 1;
                    }
                }
            }
        }

        self.state.lock().unwrap().issued.push(Issued {
            sector: io.sector(),
            direction: io.direction(),
            sg_len,
            sources: entries.iter().map(|e| e.source).collect(),
            lens: entries.iter().map(|e| e.len).collect(),
            data,
            prepared: self.before_requests.load(Ordering::SeqCst),
        });
        if fail {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }

    fn query_status(&mut self) -> io::Result<CardStatus> {
        let mut state = self.state.lock().unwrap();
        state.status_queries += 1;
        state
            .statuses
            .pop_front()
            .unwrap_or_else(|| Ok(CardStatus::READY_FOR_DATA.with_state(CardStatus::STATE_TRAN)))
    }

    fn before_request(&mut self) {
        self.before_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_possible_removal(&mut self) {
        self.removals.fetch_add(1, Ordering::SeqCst);
    }
}

struct Done {
    id: u64,
    buffers: Vec<Vec<u8>>,
    outcome: Outcome,
}

fn tracked(request: Request, tx: &mpsc::Sender<Done>) -> Request {
    let tx = tx.clone();
    request.with_completion(move |req, outcome| {
        let _ = tx.send(Done {
            id: req.id(),
            buffers: req.buffers,
            outcome,
        });
    })
}

fn single_segment_host() -> HostLimits {
    HostLimits {
        max_hw_segs: 1,
        max_phys_segs: 1,
        max_req_size: 65536,
        max_seg_size: 65536,
        max_blk_count: 256,
    }
}

fn four_segment_host() -> HostLimits {
    HostLimits {
        max_hw_segs: 4,
        max_phys_segs: 4,
        ..single_segment_host()
    }
}

fn config() -> QueueConfig {
    QueueConfig {
        removal_cooldown_ms: 10,
        ..QueueConfig::default()
    }
}

fn attach(host: &MockHost, limits: HostLimits, config: QueueConfig) -> (CardQueue, Arc<BlockQueue>) {
    let blk = Arc::new(BlockQueue::new());
    let queue = CardQueue::construct("mmc0", Box::new(host.clone()), blk.clone(), limits, config)
        .expect("construct queue");
    (queue, blk)
}

#[test]
fn completions_follow_submission_order() {
    let host = MockHost::default();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    let mut ids = Vec::new();
    for i in 0..32u64 {
        let request = if i % 3 == 0 {
            Request::read(i, vec![vec![0; 512]; 2])
        } else {
            Request::write(i, vec![vec![i as u8; 1024]])
        };
        ids.push(blk.submit(tracked(request, &tx)));
    }

    let completed: Vec<u64> = (0..32)
        .map(|_| {
            let done = rx.recv_timeout(TIMEOUT).expect("completion");
            assert!(done.outcome.is_ok());
            done.id
        })
        .collect();
    assert_eq!(completed, ids);

    let sectors: Vec<u64> = host.issued().iter().map(|i| i.sector).collect();
    assert_eq!(sectors, (0..32).collect::<Vec<_>>());
    assert_eq!(queue.teardown(), 0);
}

#[test]
fn bounced_write_reaches_host_as_one_contiguous_segment() {
    let host = MockHost::default();
    let (queue, blk) = attach(&host, single_segment_host(), config());
    assert_eq!(queue.bounce_capacity(), Some(65536));
    let (tx, rx) = mpsc::channel();

    let buffers = vec![vec![0x11; 2048], vec![0x22; 2048], vec![0x33; 2048]];
    let expected: Vec<u8> = buffers.concat();
    blk.submit(tracked(Request::write(40, buffers), &tx));

    let done = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(done.outcome.unwrap(), 6144);

    let issued = host.issued();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].sg_len, 1);
    assert_eq!(issued[0].lens, vec![6144]);
    assert_eq!(issued[0].sources, vec![SgSource::Region { offset: 0 }]);
    assert_eq!(issued[0].data, expected);
}

#[test]
fn bounced_read_scatters_into_request_buffers() {
    let host = MockHost::default();
    let (_queue, blk) = attach(&host, single_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(
        Request::read(7, vec![vec![0; 512], vec![0; 1536], vec![0; 1024]]),
        &tx,
    ));
    let done = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(done.outcome.unwrap(), 3072);

    let flat: Vec<u8> = done.buffers.concat();
    let expected: Vec<u8> = (0..3072).map(|off| read_pattern(7, off)).collect();
    assert_eq!(flat, expected);
    assert_eq!(host.issued()[0].sg_len, 1);
}

#[test]
fn direct_mapping_keeps_native_segment_count() {
    let host = MockHost::default();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    assert!(!queue.is_bounced());
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(
        Request::write(0, vec![vec![1; 2048], vec![2; 2048], vec![3; 2048]]),
        &tx,
    ));
    rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap();

    let issued = &host.issued()[0];
    assert_eq!(issued.sg_len, 3);
    assert!(
        issued
            .sources
            .iter()
            .all(|s| matches!(s, SgSource::Buffer { .. }))
    );
    assert_eq!(issued.data.len(), 6144);
}

#[test]
fn failed_read_leaves_destination_untouched() {
    let host = MockHost::default();
    host.state.lock().unwrap().fail_reads = true;
    let (_queue, blk) = attach(&host, single_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(Request::read(3, vec![vec![0; 1024], vec![0; 1024]]), &tx));
    let done = rx.recv_timeout(TIMEOUT).unwrap();
    let err = done.outcome.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EIO));
    assert!(done.buffers.iter().flatten().all(|b| *b == 0));

    // The pipeline keeps going after a failure.
    blk.submit(tracked(Request::write(4, vec![vec![9; 512]]), &tx));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_ok());
}

#[test]
fn suspend_waits_for_in_flight_request() {
    let (host, entered, release) = MockHost::holding();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    let queue = Arc::new(queue);
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(Request::write(1, vec![vec![1; 512]]), &tx));
    assert_eq!(entered.recv_timeout(TIMEOUT).unwrap(), 1);
    assert_eq!(queue.worker_state(), WorkerState::Issuing);

    let (suspended_tx, suspended_rx) = mpsc::channel();
    let suspender = {
        let queue = queue.clone();
        std::thread::spawn(move || {
            queue.suspend();
            suspended_tx.send(()).unwrap();
        })
    };
    assert!(suspended_rx.recv_timeout(Duration::from_millis(100)).is_err());

    release.send(()).unwrap();
    suspended_rx.recv_timeout(TIMEOUT).unwrap();
    suspender.join().unwrap();
    // The in-flight request finished before suspend returned.
    assert!(rx.try_recv().unwrap().outcome.is_ok());
    assert!(queue.is_suspended());

    // Nothing is claimed while suspended.
    blk.submit(tracked(Request::write(2, vec![vec![2; 512]]), &tx));
    assert!(entered.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(blk.depth(), 1);

    queue.resume();
    assert_eq!(entered.recv_timeout(TIMEOUT).unwrap(), 2);
    release.send(()).unwrap();
    assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_ok());
}

#[test]
fn completion_reads_suspend_flag_while_suspend_waits() {
    let (host, entered, release) = MockHost::holding();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    let queue = Arc::new(queue);
    let (seen_tx, seen_rx) = mpsc::channel();

    let observer = Arc::downgrade(&queue);
    blk.submit(
        Request::write(1, vec![vec![1; 512]]).with_completion(move |_, outcome| {
            let suspended = observer.upgrade().map(|queue| queue.is_suspended());
            let _ = seen_tx.send((outcome.is_ok(), suspended));
        }),
    );
    assert_eq!(entered.recv_timeout(TIMEOUT).unwrap(), 1);

    let (suspended_tx, suspended_rx) = mpsc::channel();
    let suspender = {
        let queue = queue.clone();
        std::thread::spawn(move || {
            queue.suspend();
            suspended_tx.send(()).unwrap();
        })
    };
    assert!(suspended_rx.recv_timeout(Duration::from_millis(100)).is_err());
    // Flag is visible while suspend still waits on the in-flight request.
    assert!(queue.is_suspended());

    release.send(()).unwrap();
    assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), (true, Some(true)));
    suspended_rx.recv_timeout(TIMEOUT).unwrap();
    suspender.join().unwrap();
    assert!(queue.is_suspended());
}

#[test]
fn suspend_and_resume_are_idempotent() {
    let host = MockHost::default();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    queue.suspend();
    queue.suspend();
    assert!(queue.is_suspended());
    assert!(blk.is_stopped());

    queue.resume();
    queue.resume();
    assert!(!queue.is_suspended());

    blk.submit(tracked(Request::write(5, vec![vec![5; 512]]), &tx));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_ok());
}

#[test]
fn teardown_fails_every_pending_request() {
    let host = MockHost::default();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    queue.suspend();
    for sector in 0..5 {
        blk.submit(tracked(Request::write(sector, vec![vec![0; 512]]), &tx));
    }
    assert_eq!(blk.depth(), 5);

    assert_eq!(queue.teardown(), 5);
    let failed: Vec<Done> = rx.try_iter().collect();
    assert_eq!(failed.len(), 5);
    assert!(
        failed
            .iter()
            .all(|d| matches!(&d.outcome, Err(e) if e.raw_os_error() == Some(libc::EIO)))
    );
    assert!(host.issued().is_empty());

    // Late submissions fail straight away.
    blk.submit(tracked(Request::read(9, vec![vec![0; 512]]), &tx));
    assert!(rx.try_recv().unwrap().outcome.is_err());
}

#[test]
fn teardown_lets_in_flight_request_finish() {
    let (host, entered, release) = MockHost::holding();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    let first = blk.submit(tracked(Request::write(1, vec![vec![1; 512]]), &tx));
    assert_eq!(entered.recv_timeout(TIMEOUT).unwrap(), 1);
    for sector in 2..5 {
        blk.submit(tracked(Request::write(sector, vec![vec![0; 512]]), &tx));
    }
    assert_eq!(blk.depth(), 3);

    let (done_tx, done_rx) = mpsc::channel();
    let teardown = std::thread::spawn(move || {
        let drained = queue.teardown();
        done_tx.send(()).unwrap();
        drained
    });
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(rx.try_recv().is_err());

    release.send(()).unwrap();
    done_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(teardown.join().unwrap(), 3);

    let results: Vec<Done> = rx.try_iter().collect();
    assert_eq!(results.len(), 4);
    assert_eq!(results[0].id, first);
    assert!(results[0].outcome.is_ok());
    assert!(
        results[1..]
            .iter()
            .all(|d| matches!(&d.outcome, Err(e) if e.raw_os_error() == Some(libc::EIO)))
    );
    assert_eq!(host.issued().len(), 1);
}

#[test]
fn host_is_prepared_before_every_issued_request() {
    let host = MockHost::default();
    let (_queue, blk) = attach(&host, four_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(Request::write(0, vec![vec![0; 512]]), &tx));
    // Rejected at submission, never claimed.
    blk.submit(tracked(Request::write(1, vec![vec![0; 512]; 5]), &tx));
    blk.submit(tracked(Request::read(2, vec![vec![0; 1024]]), &tx));
    for _ in 0..3 {
        rx.recv_timeout(TIMEOUT).unwrap();
    }

    assert_eq!(host.before_requests.load(Ordering::SeqCst), 2);
    let prepared: Vec<usize> = host.issued().iter().map(|i| i.prepared).collect();
    assert_eq!(prepared, vec![1, 2]);
}

#[test]
fn failed_status_query_reports_removal_and_continues() {
    let host = MockHost::default();
    host.state
        .lock()
        .unwrap()
        .statuses
        .push_back(Err(io::Error::from_raw_os_error(libc::ETIMEDOUT)));
    let (_queue, blk) = attach(&host, four_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    for sector in 0..3 {
        blk.submit(tracked(Request::write(sector, vec![vec![0; 512]]), &tx));
    }
    for _ in 0..3 {
        assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_ok());
    }
    assert_eq!(host.removals.load(Ordering::SeqCst), 1);
    assert_eq!(host.issued().len(), 3);
}

#[test]
fn failed_issue_skips_status_query() {
    let host = MockHost::default();
    host.state.lock().unwrap().fail_reads = true;
    let (_queue, blk) = attach(&host, four_segment_host(), config());
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(Request::read(0, vec![vec![0; 512]]), &tx));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_err());
    assert_eq!(host.state.lock().unwrap().status_queries, 0);
}

#[test]
fn paranoid_resume_polls_until_ready() {
    let host = MockHost::default();
    let config = QueueConfig {
        paranoid_resume: true,
        paranoid_retry_delay_ms: 1,
        status_check: false,
        ..config()
    };
    let (queue, blk) = attach(&host, four_segment_host(), config);
    let (tx, rx) = mpsc::channel();

    queue.suspend();
    {
        let mut state = host.state.lock().unwrap();
        state
            .statuses
            .push_back(Ok(CardStatus::READY_FOR_DATA.with_state(CardStatus::STATE_PRG)));
        state
            .statuses
            .push_back(Ok(CardStatus::READY_FOR_DATA.with_state(CardStatus::STATE_TRAN)));
    }
    queue.resume();

    blk.submit(tracked(Request::write(0, vec![vec![0; 512]]), &tx));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_ok());
    assert_eq!(host.state.lock().unwrap().status_queries, 2);
}

#[test]
fn oversized_request_is_rejected_before_the_worker() {
    let host = MockHost::default();
    let (queue, blk) = attach(&host, four_segment_host(), config());
    assert_eq!(queue.queue_limits().max_segments, 4);
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(Request::write(0, vec![vec![0; 512]; 5]), &tx));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_err());
    assert!(host.issued().is_empty());
}

#[test]
fn unallocatable_tables_fail_construction() {
    let host = MockHost::default();
    let blk = Arc::new(BlockQueue::new());
    let limits = HostLimits {
        max_phys_segs: usize::MAX,
        ..four_segment_host()
    };
    let err = CardQueue::construct("mmc0", Box::new(host), blk.clone(), limits, config())
        .unwrap_err();
    assert!(matches!(err, QueueError::OutOfMemory { .. }));
    assert!(blk.limits().is_none());
}

#[test]
fn tiny_bounce_capacity_falls_back_to_direct() {
    let host = MockHost::default();
    let limits = HostLimits {
        max_blk_count: 1,
        ..single_segment_host()
    };
    let (queue, blk) = attach(&host, limits, config());
    assert!(!queue.is_bounced());
    let (tx, rx) = mpsc::channel();

    blk.submit(tracked(Request::write(0, vec![vec![4; 512]]), &tx));
    rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap();
    assert_eq!(
        host.issued()[0].sources,
        vec![SgSource::Buffer {
            index: 0,
            offset: 0
        }]
    );
}

#[test]
fn requests_queued_before_attach_are_serviced() {
    let host = MockHost::default();
    let blk = Arc::new(BlockQueue::new());
    let (tx, rx) = mpsc::channel();
    blk.submit(tracked(Request::write(0, vec![vec![1; 512]]), &tx));

    let _queue = CardQueue::construct(
        "mmc0",
        Box::new(host.clone()),
        blk.clone(),
        four_segment_host(),
        config(),
    )
    .unwrap();
    assert!(rx.recv_timeout(TIMEOUT).unwrap().outcome.is_ok());
    assert_eq!(host.issued()[0].direction, Direction::Write);
}
