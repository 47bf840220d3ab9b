use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::buffer::ByteBuffer;
use crate::config::Config;
use crate::connection::{ConnectionManager, TcpSettings};
use crate::io::LINK_TIMEOUT_DATA;
use crate::map::ShardedMap;
use crate::message::OriginalMessage;
use crate::queue::RingQueue;
use crate::task::HttpTask;
use crate::Result;

/// Default receive chunk size.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Per-message wall-clock stamps, indexed by trace id.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageTiming {
    pub start: Option<Instant>,
    pub finish: Option<Instant>,
    pub size: u64,
}

/// Shared state of a worker fleet: the bounded submission queue, the
/// buffer-reuse queue, the finished-message map for callers without
/// callbacks, and the parked workers. The group never spawns threads;
/// callers run workers on their own threads through handles.
pub struct WorkerGroup {
    submissions: RingQueue<Box<OriginalMessage>>,
    reuse: RingQueue<ByteBuffer>,
    finished: ShardedMap<u64, Box<OriginalMessage>>,
    parked: Mutex<Vec<Worker>>,
    tcp: RwLock<TcpSettings>,
    chunk_size: usize,
    concurrent_requests: AtomicU64,
    sleep: Mutex<()>,
    wake: Condvar,
}

impl WorkerGroup {
    pub fn new(concurrent_requests: u64, submissions: usize) -> Self {
        Self::with_sizes(concurrent_requests, submissions, DEFAULT_CHUNK_SIZE, 0)
    }

    /// `reuse` of 0 sizes the recycle pool at 0.2x the submission queue.
    pub fn with_sizes(
        concurrent_requests: u64,
        submissions: usize,
        chunk_size: usize,
        reuse: usize,
    ) -> Self {
        let reuse = if reuse == 0 {
            (submissions / 5).max(1)
        } else {
            reuse
        };
        WorkerGroup {
            submissions: RingQueue::new(submissions),
            reuse: RingQueue::new(reuse),
            finished: ShardedMap::with_buckets(64),
            parked: Mutex::new(Vec::new()),
            tcp: RwLock::new(TcpSettings::default()),
            chunk_size,
            concurrent_requests: AtomicU64::new(concurrent_requests),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Submit one message. Full queue returns the message for the caller
    /// to retry or spill.
    pub fn send(&self, msg: Box<OriginalMessage>) -> std::result::Result<u64, Box<OriginalMessage>> {
        let id = msg.id;
        self.submissions.try_insert(msg)?;
        self.notify_all();
        Ok(id)
    }

    /// Submit a batch as one contiguous claim.
    pub fn send_many(
        &self,
        msgs: Vec<Box<OriginalMessage>>,
    ) -> std::result::Result<Vec<u64>, Vec<Box<OriginalMessage>>> {
        let ids = msgs.iter().map(|m| m.id).collect();
        self.submissions.try_insert_many(msgs)?;
        self.notify_all();
        Ok(ids)
    }

    /// Fetch a finished message without a callback, if delivered yet.
    pub fn receive(&self, id: u64) -> Option<Box<OriginalMessage>> {
        self.finished.remove(&id)
    }

    /// Block until the message is delivered.
    pub fn receive_sync(&self, id: u64) -> Box<OriginalMessage> {
        loop {
            if let Some(msg) = self.finished.remove(&id) {
                return msg;
            }
            let guard = self.sleep.lock().unwrap();
            let _ = self
                .wake
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
        }
    }

    /// Pop a parked worker or build a fresh one.
    pub fn get_handle(&self) -> Result<WorkerHandle<'_>> {
        let worker = match self.parked.lock().unwrap().pop() {
            Some(worker) => worker,
            None => Worker::new(self.concurrent_requests() as u32)?,
        };
        Ok(WorkerHandle {
            group: self,
            worker: Some(worker),
        })
    }

    /// Convenience: obtain a handle and drain the queue once.
    pub fn process(&self) -> Result<()> {
        let mut handle = self.get_handle()?;
        handle.process(true);
        Ok(())
    }

    /// Apply bandwidth-derived sizing.
    pub fn set_config(&self, config: &Config) {
        self.concurrent_requests
            .store(config.core_requests() as u64, Ordering::Relaxed);
    }

    pub fn set_tcp_settings(&self, settings: TcpSettings) {
        *self.tcp.write().unwrap() = settings;
    }

    pub fn tcp_settings(&self) -> TcpSettings {
        self.tcp.read().unwrap().clone()
    }

    pub fn concurrent_requests(&self) -> u64 {
        self.concurrent_requests.load(Ordering::Relaxed)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Recycle a result buffer. Unowned or empty buffers are dropped, as is
    /// overflow past the queue capacity.
    pub fn reuse_buffer(&self, buffer: ByteBuffer) {
        if buffer.owned() && buffer.capacity() > 0 {
            let _ = self.reuse.try_insert(buffer);
        }
    }

    pub(crate) fn take_reuse_buffer(&self) -> Option<ByteBuffer> {
        self.reuse.try_consume()
    }

    pub(crate) fn notify_all(&self) {
        let _guard = self.sleep.lock().unwrap();
        self.wake.notify_all();
    }

    fn park_wait(&self) {
        let guard = self.sleep.lock().unwrap();
        let _ = self
            .wake
            .wait_timeout(guard, Duration::from_millis(10))
            .unwrap();
    }
}

/// One single-threaded event loop: its own kernel ring, connection
/// manager and task arena. Tasks are arena slots addressed by index; the
/// kernel's user_data carries the index, never a pointer.
pub struct Worker {
    conn: ConnectionManager,
    tasks: Vec<Option<HttpTask>>,
    free: Vec<usize>,
    local: VecDeque<Box<OriginalMessage>>,
    stop: Arc<AtomicBool>,
    active: usize,
    timings: Option<Vec<MessageTiming>>,
}

impl Worker {
    fn new(concurrent_requests: u32) -> Result<Self> {
        let entries = (concurrent_requests.max(4)) << 2;
        Ok(Worker {
            conn: ConnectionManager::new(entries, concurrent_requests.max(4) as usize)?,
            tasks: Vec::new(),
            free: Vec::new(),
            local: VecDeque::new(),
            stop: Arc::new(AtomicBool::new(false)),
            active: 0,
            timings: None,
        })
    }
}

/// Cooperative stop signal for a worker running on another thread. The
/// worker observes it between loop iterations; in-flight operations finish
/// or time out rather than being cancelled.
#[derive(Clone)]
pub struct Stopper(Arc<AtomicBool>);

impl Stopper {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// A checked-out worker. Processing happens on whichever thread calls
/// `process`; dropping the handle parks the worker back into the group.
pub struct WorkerHandle<'g> {
    group: &'g WorkerGroup,
    worker: Option<Worker>,
}

impl<'g> WorkerHandle<'g> {
    pub fn group(&self) -> &'g WorkerGroup {
        self.group
    }

    pub fn stopper(&self) -> Stopper {
        Stopper(self.worker.as_ref().unwrap().stop.clone())
    }

    /// Queue a message on the worker-local queue, drained ahead of the
    /// group queue by `process`.
    pub fn send_sync(&mut self, msg: Box<OriginalMessage>) -> u64 {
        let id = msg.id;
        self.worker.as_mut().unwrap().local.push_back(msg);
        id
    }

    /// Provide a timing table indexed by trace id.
    pub fn set_timings(&mut self, timings: Vec<MessageTiming>) {
        self.worker.as_mut().unwrap().timings = Some(timings);
    }

    pub fn take_timings(&mut self) -> Option<Vec<MessageTiming>> {
        self.worker.as_mut().unwrap().timings.take()
    }

    /// Run the event loop. With `one_queue_invocation` the loop drains the
    /// local and group queues and returns once everything in flight
    /// settled; otherwise it serves until stopped.
    pub fn process(&mut self, one_queue_invocation: bool) {
        let group = self.group;
        let worker = self.worker.as_mut().unwrap();
        worker.stop.store(false, Ordering::Relaxed);
        let mut in_flight = 0usize;

        loop {
            if in_flight > 0 {
                match worker.conn.io_mut().complete() {
                    Ok(completion) => {
                        in_flight -= 1;
                        if completion.user_data != LINK_TIMEOUT_DATA {
                            Self::on_completion(
                                group,
                                worker,
                                completion.user_data as usize,
                                completion.result,
                            );
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "completion wait failed");
                    }
                }
            }

            let stopped = worker.stop.load(Ordering::Relaxed);
            if !stopped {
                Self::admit_submissions(group, worker);
            }

            match worker.conn.io_mut().submit() {
                Ok(submitted) => in_flight += submitted,
                Err(err) => tracing::error!(%err, "ring submit failed"),
            }

            let queues_empty = worker.local.is_empty() && group.submissions.empty();
            let drained = queues_empty && in_flight == 0 && worker.active == 0;
            if one_queue_invocation && drained {
                break;
            }
            if stopped && in_flight == 0 {
                break;
            }
            if !one_queue_invocation && drained {
                group.park_wait();
            }
        }
    }

    /// Turn queued messages into running tasks, up to the concurrency
    /// limit. The local queue goes first.
    fn admit_submissions(group: &WorkerGroup, worker: &mut Worker) {
        let limit = group.concurrent_requests() as usize;
        while worker.active < limit {
            let Some(mut msg) = worker
                .local
                .pop_front()
                .or_else(|| group.submissions.try_consume())
            else {
                break;
            };
            if let Some(buffer) = group.take_reuse_buffer() {
                msg.adopt_buffer(buffer);
            }
            if let Some(timings) = worker.timings.as_mut() {
                if let Some(slot) = timings.get_mut(msg.trace_id as usize) {
                    slot.start = Some(Instant::now());
                }
            }

            let index = match worker.free.pop() {
                Some(index) => index,
                None => {
                    worker.tasks.push(None);
                    worker.tasks.len() - 1
                }
            };
            let mut task = HttpTask::new(
                msg,
                group.chunk_size(),
                group.tcp_settings(),
                index as u64,
            );
            let state = task.execute(&mut worker.conn);
            if state.is_terminal() {
                worker.free.push(index);
                Self::deliver(group, worker.timings.as_mut(), task);
                continue;
            }
            worker.tasks[index] = Some(task);
            worker.active += 1;
        }
    }

    fn on_completion(group: &WorkerGroup, worker: &mut Worker, index: usize, result: i32) {
        let Some(task) = worker.tasks.get_mut(index).and_then(|slot| slot.as_mut()) else {
            tracing::warn!(index, "completion for unknown task");
            return;
        };
        if let Some(request) = task.request.as_mut() {
            request.length = result as i64;
        }
        let state = task.execute(&mut worker.conn);
        if state.is_terminal() {
            let task = worker.tasks[index].take().unwrap();
            worker.free.push(index);
            worker.active -= 1;
            Self::deliver(group, worker.timings.as_mut(), task);
        }
    }

    /// Invoke the callback or stash the message for `receive`, stamp the
    /// timing, and recycle whatever buffer the caller did not retain.
    fn deliver(group: &WorkerGroup, timings: Option<&mut Vec<MessageTiming>>, task: HttpTask) {
        let mut msg = task.into_message();
        if let Some(timings) = timings {
            if let Some(slot) = timings.get_mut(msg.trace_id as usize) {
                slot.finish = Some(Instant::now());
                slot.size = msg.result.size();
            }
        }
        tracing::trace!(id = msg.id, state = ?msg.result.state(), "delivering");
        if msg.requires_finish() {
            msg.finish();
            let buffer = msg.result.take_buffer();
            group.reuse_buffer(buffer);
        } else {
            let id = msg.id;
            group.finished.insert(id, msg);
        }
        group.notify_all();
    }
}

impl Drop for WorkerHandle<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.group.parked.lock().unwrap().push(worker);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{FailureCode, MessageState};
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    /// Tiny HTTP server: answers every request on every connection with
    /// the same body until the listener drops.
    fn http_server(body: &'static [u8]) -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = listener.try_clone().unwrap();
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = accept.accept() {
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => seen.extend_from_slice(&buf[..n]),
                        }
                        if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes());
                    let _ = stream.write_all(body);
                    std::thread::sleep(Duration::from_millis(100));
                });
            }
        });
        (listener, port)
    }

    fn get_message(port: u16) -> Box<OriginalMessage> {
        let request = format!("GET /blob? HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n");
        Box::new(OriginalMessage::new(
            ByteBuffer::from_slice(request.as_bytes()),
            "localhost",
            port,
            false,
        ))
    }

    #[test]
    fn ten_concurrent_gets_all_finish() {
        let (_listener, port) = http_server(b"payload-payload-payload");
        let group = WorkerGroup::new(10, 64);

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(group.send(get_message(port)).unwrap());
        }
        group.process().unwrap();

        let mut bodies = Vec::new();
        for id in ids {
            let msg = group.receive(id).expect("message delivered");
            assert_eq!(msg.result.state(), MessageState::Finished);
            assert!(msg.result.failure_code().is_empty());
            bodies.push(msg.result.body().to_vec());
        }
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn callbacks_fire_once_and_buffers_recycle() {
        let (_listener, port) = http_server(b"abc");
        let group = WorkerGroup::new(4, 16);
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let fired = fired.clone();
            let msg = get_message(port).with_callback(Box::new(move |result| {
                assert!(result.success());
                assert_eq!(result.body(), b"abc");
                fired.fetch_add(1, Ordering::Relaxed);
            }));
            group.send(Box::new(msg)).unwrap();
        }
        group.process().unwrap();

        assert_eq!(fired.load(Ordering::Relaxed), 4);
        // Callback messages hand their buffers back for reuse.
        assert!(group.take_reuse_buffer().is_some());
    }

    #[test]
    fn back_pressure_returns_the_message() {
        let group = WorkerGroup::new(1, 2);
        assert!(group.send(get_message(1)).is_ok());
        assert!(group.send(get_message(1)).is_ok());
        let refused = group.send(get_message(1));
        assert!(refused.is_err(), "third insert into capacity-2 queue");
    }

    #[test]
    fn worker_thread_with_stopper() {
        let (_listener, port) = http_server(b"looped");
        let group = WorkerGroup::new(4, 16);

        std::thread::scope(|scope| {
            let mut handle = group.get_handle().unwrap();
            let stopper = handle.stopper();
            let runner = scope.spawn(move || {
                handle.process(false);
            });

            let id = group.send(get_message(port)).unwrap();
            let msg = group.receive_sync(id);
            assert!(msg.result.success());
            assert_eq!(msg.result.body(), b"looped");

            stopper.stop();
            runner.join().unwrap();
        });
    }

    #[test]
    fn aborted_messages_deliver_with_failure_bits() {
        // Nobody listens on this port.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let group = WorkerGroup::new(2, 8);
        group.set_tcp_settings(TcpSettings {
            timeout: Duration::from_millis(30),
            ..TcpSettings::default()
        });

        let id = group.send(get_message(port)).unwrap();
        group.process().unwrap();

        let msg = group.receive(id).expect("aborted message still delivered");
        assert_eq!(msg.result.state(), MessageState::Aborted);
        assert!(!msg.result.failure_code().is_empty());
        assert!(msg
            .result
            .failure_code()
            .contains(FailureCode::SOCKET_CREATE));
    }
}
