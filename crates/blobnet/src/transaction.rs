use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::buffer::ByteBuffer;
use crate::http::HttpResponse;
use crate::message::{MessageCallback, MessageResult, OriginalMessage};
use crate::provider::Provider;
use crate::worker::{WorkerGroup, WorkerHandle};
use crate::Result;

/// Lifecycle of one multipart upload. Sending and Validating are the
/// "submittable" states: a processing pass moves their messages into the
/// queue and drops back to Default until the next acknowledgement advances
/// the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultipartState {
    Default,
    Sending,
    Validating,
    Aborted,
}

/// One large PUT split into initiate / parts / complete. Shared between
/// the transaction (which submits) and the delivery callbacks (which
/// advance the state as acknowledgements land).
pub struct MultipartUpload {
    pub state: MultipartState,
    pub upload_id: String,
    /// Indexed by part number - 1; all populated before completion is sent.
    pub etags: Vec<Option<String>>,
    parts: Vec<Option<Box<OriginalMessage>>>,
    finalize: Option<Box<OriginalMessage>>,
    outstanding: usize,
    done: bool,
    callback: Option<MessageCallback>,
}

impl MultipartUpload {
    fn new(part_count: usize, callback: Option<MessageCallback>) -> Self {
        MultipartUpload {
            state: MultipartState::Default,
            upload_id: String::new(),
            etags: vec![None; part_count],
            parts: (0..part_count).map(|_| None).collect(),
            finalize: None,
            outstanding: part_count,
            done: false,
            callback,
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Terminal failure: surface the triggering result to the caller once.
    fn abort(&mut self, result: &mut MessageResult, completed: &AtomicUsize) {
        self.state = MultipartState::Aborted;
        if !self.done {
            self.done = true;
            completed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

type MultipartHandle = Arc<Mutex<MultipartUpload>>;

/// A caller-visible bundle of requests against one provider, composing
/// credential-refresh prerequisites and multipart uploads on top of the
/// submission queues. Requests of a transaction are unordered between each
/// other; only refresh-before-request and the multipart phases are
/// sequenced.
pub struct Transaction {
    provider: Arc<dyn Provider>,
    pending: VecDeque<Box<OriginalMessage>>,
    ids: Vec<u64>,
    multiparts: Vec<MultipartHandle>,
    completed_multiparts: Arc<AtomicUsize>,
}

impl Transaction {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Transaction {
            provider,
            pending: VecDeque::new(),
            ids: Vec::new(),
            multiparts: Vec::new(),
            completed_multiparts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Ids of submitted messages without callbacks; their results are
    /// fetched from the group with `receive`.
    pub fn message_ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn multipart_uploads(&self) -> &[MultipartHandle] {
        &self.multiparts
    }

    pub fn multiparts_done(&self) -> bool {
        self.completed_multiparts.load(Ordering::Relaxed) == self.multiparts.len()
    }

    /// Queue a GET, optionally over a byte range.
    pub fn add_get(&mut self, path: &str, range: Option<(u64, u64)>) -> Result<()> {
        self.add_get_inner(path, range, None)
    }

    pub fn add_get_with_callback(
        &mut self,
        path: &str,
        range: Option<(u64, u64)>,
        callback: MessageCallback,
    ) -> Result<()> {
        self.add_get_inner(path, range, Some(callback))
    }

    fn add_get_inner(
        &mut self,
        path: &str,
        range: Option<(u64, u64)>,
        callback: Option<MessageCallback>,
    ) -> Result<()> {
        let header = self.provider.get_request(path, range)?;
        self.push_plain(header, None, callback);
        Ok(())
    }

    /// Queue a PUT. Objects above the provider's multipart threshold split
    /// into a multipart upload.
    pub fn add_put(&mut self, path: &str, data: Bytes) -> Result<()> {
        self.add_put_inner(path, data, None)
    }

    pub fn add_put_with_callback(
        &mut self,
        path: &str,
        data: Bytes,
        callback: MessageCallback,
    ) -> Result<()> {
        self.add_put_inner(path, data, Some(callback))
    }

    fn add_put_inner(
        &mut self,
        path: &str,
        data: Bytes,
        callback: Option<MessageCallback>,
    ) -> Result<()> {
        let threshold = self.provider.multipart_upload_size();
        if threshold > 0 && data.len() as u64 > threshold {
            return self.add_multipart_put(path, data, callback);
        }
        let header = self.provider.put_request(path, &data)?;
        self.push_plain(header, Some(data), callback);
        Ok(())
    }

    pub fn add_delete(&mut self, path: &str) -> Result<()> {
        self.add_delete_inner(path, None)
    }

    pub fn add_delete_with_callback(
        &mut self,
        path: &str,
        callback: MessageCallback,
    ) -> Result<()> {
        self.add_delete_inner(path, Some(callback))
    }

    fn add_delete_inner(&mut self, path: &str, callback: Option<MessageCallback>) -> Result<()> {
        let header = self.provider.delete_request(path)?;
        self.push_plain(header, None, callback);
        Ok(())
    }

    /// Run `build` with fresh credentials: when the provider reports a due
    /// refresh, it completes synchronously through `handle` before the
    /// wrapped request is built. This is the only place the engine enforces
    /// inter-message ordering.
    pub fn verify_key_request<F>(&mut self, handle: &mut WorkerHandle<'_>, build: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        if !self.provider.credentials_valid() {
            tracing::debug!("credentials due, refreshing before request");
            self.provider.refresh_credentials(handle)?;
        }
        build(self)
    }

    fn push_plain(
        &mut self,
        header: ByteBuffer,
        body: Option<Bytes>,
        callback: Option<MessageCallback>,
    ) {
        let mut msg = OriginalMessage::new(
            header,
            self.provider.address(),
            self.provider.port(),
            self.provider.tls(),
        );
        if let Some(body) = body {
            msg = msg.with_put_body(body);
        }
        if let Some(callback) = callback {
            msg = msg.with_callback(callback);
        }
        self.pending.push_back(Box::new(msg));
    }

    /// Build the initiate message of a multipart upload. Parts are built by
    /// the initiate acknowledgement (which carries the UploadId), the
    /// completion by the last part acknowledgement; submission of each
    /// phase happens on the following processing pass.
    fn add_multipart_put(
        &mut self,
        path: &str,
        data: Bytes,
        callback: Option<MessageCallback>,
    ) -> Result<()> {
        let part_size = self.provider.multipart_upload_size() as usize;
        let part_count = (data.len() + part_size - 1) / part_size;
        let record = Arc::new(Mutex::new(MultipartUpload::new(part_count, callback)));
        self.multiparts.push(record.clone());

        let header = self.provider.create_multipart_request(path)?;
        let provider = self.provider.clone();
        let path = path.to_string();
        let completed = self.completed_multiparts.clone();

        let on_create = Box::new(move |result: &mut MessageResult| {
            let mut rec = record.lock().unwrap();
            if !result.success() {
                rec.abort(result, &completed);
                return;
            }
            let Some(upload_id) = find_xml_tag(result.body(), "UploadId") else {
                result.mark_protocol_failure();
                rec.abort(result, &completed);
                return;
            };
            rec.upload_id = upload_id;
            for part in 0..part_count {
                let at = part * part_size;
                let chunk = data.slice(at..data.len().min(at + part_size));
                let header = match provider.put_part_request(
                    &path,
                    (part + 1) as u16,
                    &rec.upload_id,
                    &chunk,
                ) {
                    Ok(header) => header,
                    Err(err) => {
                        tracing::warn!(%err, part, "part request build failed");
                        result.mark_protocol_failure();
                        rec.abort(result, &completed);
                        return;
                    }
                };
                let on_part = part_callback(
                    record.clone(),
                    provider.clone(),
                    path.clone(),
                    completed.clone(),
                    part,
                );
                let msg = OriginalMessage::new(
                    header,
                    provider.address(),
                    provider.port(),
                    provider.tls(),
                )
                .with_put_body(chunk)
                .with_callback(on_part);
                rec.parts[part] = Some(Box::new(msg));
            }
            rec.state = MultipartState::Sending;
        });

        let msg = OriginalMessage::new(
            header,
            self.provider.address(),
            self.provider.port(),
            self.provider.tls(),
        )
        .with_callback(on_create);
        self.pending.push_back(Box::new(msg));
        Ok(())
    }

    /// Submit everything currently submittable to the group. False under
    /// back-pressure; queued work is preserved and resubmitted next pass.
    pub fn process_async(&mut self, group: &WorkerGroup) -> bool {
        let mut batch: Vec<Box<OriginalMessage>> = self.pending.drain(..).collect();
        for record in &self.multiparts {
            let mut rec = record.lock().unwrap();
            match rec.state {
                MultipartState::Sending => {
                    for slot in rec.parts.iter_mut() {
                        if let Some(msg) = slot.take() {
                            batch.push(msg);
                        }
                    }
                    rec.state = MultipartState::Default;
                }
                MultipartState::Validating => {
                    if let Some(msg) = rec.finalize.take() {
                        batch.push(msg);
                    }
                    rec.state = MultipartState::Default;
                }
                MultipartState::Default | MultipartState::Aborted => {}
            }
        }
        if batch.is_empty() {
            return true;
        }
        let plain_ids: Vec<u64> = batch
            .iter()
            .filter(|m| !m.requires_finish())
            .map(|m| m.id)
            .collect();
        match group.send_many(batch) {
            Ok(_) => {
                self.ids.extend(plain_ids);
                true
            }
            Err(batch) => {
                self.pending.extend(batch);
                false
            }
        }
    }

    /// Drive everything to completion on the calling thread, including all
    /// multipart phases.
    pub fn process_sync(&mut self, handle: &mut WorkerHandle<'_>) -> Result<()> {
        loop {
            let mut batch: Vec<Box<OriginalMessage>> = self.pending.drain(..).collect();
            for record in &self.multiparts {
                let mut rec = record.lock().unwrap();
                match rec.state {
                    MultipartState::Sending => {
                        for slot in rec.parts.iter_mut() {
                            if let Some(msg) = slot.take() {
                                batch.push(msg);
                            }
                        }
                        rec.state = MultipartState::Default;
                    }
                    MultipartState::Validating => {
                        if let Some(msg) = rec.finalize.take() {
                            batch.push(msg);
                        }
                        rec.state = MultipartState::Default;
                    }
                    MultipartState::Default | MultipartState::Aborted => {}
                }
            }
            for msg in batch {
                if !msg.requires_finish() {
                    self.ids.push(msg.id);
                }
                handle.send_sync(msg);
            }
            handle.process(true);
            if self.multiparts_done() {
                return Ok(());
            }
        }
    }
}

/// Per-part delivery: record the etag, and once the last part landed,
/// build the completion message with the etags in part-number order.
fn part_callback(
    record: MultipartHandle,
    provider: Arc<dyn Provider>,
    path: String,
    completed: Arc<AtomicUsize>,
    part: usize,
) -> MessageCallback {
    Box::new(move |result: &mut MessageResult| {
        let mut rec = record.lock().unwrap();
        if rec.state == MultipartState::Aborted {
            return;
        }
        if !result.success() {
            rec.abort(result, &completed);
            return;
        }
        let etag = HttpResponse::deserialize(&result.data()[..result.offset() as usize])
            .ok()
            .and_then(|response| {
                response
                    .header("ETag")
                    .map(|v| v.trim_matches('"').to_string())
            });
        let Some(etag) = etag else {
            result.mark_protocol_failure();
            rec.abort(result, &completed);
            return;
        };
        rec.etags[part] = Some(etag);
        rec.outstanding -= 1;
        if rec.outstanding > 0 {
            return;
        }

        // All parts acknowledged: build the completion.
        let etags: Vec<String> = rec.etags.iter().map(|e| e.clone().unwrap()).collect();
        let header = match provider.complete_multipart_request(&path, &rec.upload_id, &etags) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(%err, "completion request build failed");
                result.mark_protocol_failure();
                rec.abort(result, &completed);
                return;
            }
        };
        let on_finalize = finalize_callback(record.clone(), completed.clone());
        let msg =
            OriginalMessage::new(header, provider.address(), provider.port(), provider.tls())
                .with_callback(on_finalize);
        rec.finalize = Some(Box::new(msg));
        rec.state = MultipartState::Validating;
    })
}

fn finalize_callback(record: MultipartHandle, completed: Arc<AtomicUsize>) -> MessageCallback {
    Box::new(move |result: &mut MessageResult| {
        let mut rec = record.lock().unwrap();
        if !result.success() {
            rec.abort(result, &completed);
            return;
        }
        rec.state = MultipartState::Default;
        rec.done = true;
        completed.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = rec.callback.take() {
            callback(result);
        }
    })
}

/// First occurrence of `<tag>value</tag>` in an XML body.
fn find_xml_tag(body: &[u8], tag: &str) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::TcpSettings;
    use crate::http::request::{HttpRequest, Method};
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicU16;

    /// Unsigned provider against a local endpoint, multipart-capable.
    struct LocalProvider {
        port: u16,
        multipart_size: u64,
    }

    impl LocalProvider {
        fn request(&self, method: Method, path: &str) -> HttpRequest {
            let mut request = HttpRequest::new(method, format!("/{path}"));
            request
                .headers
                .insert("Host".into(), format!("localhost:{}", self.port));
            request
        }
    }

    impl Provider for LocalProvider {
        fn get_request(&self, path: &str, _range: Option<(u64, u64)>) -> Result<ByteBuffer> {
            self.request(Method::Get, path).serialize()
        }

        fn put_request(&self, path: &str, object: &[u8]) -> Result<ByteBuffer> {
            let mut request = self.request(Method::Put, path);
            request
                .headers
                .insert("Content-Length".into(), object.len().to_string());
            request.serialize()
        }

        fn delete_request(&self, path: &str) -> Result<ByteBuffer> {
            self.request(Method::Delete, path).serialize()
        }

        fn create_multipart_request(&self, path: &str) -> Result<ByteBuffer> {
            let mut request = self.request(Method::Post, path);
            request.queries.insert("uploads".into(), String::new());
            request.headers.insert("Content-Length".into(), "0".into());
            request.serialize()
        }

        fn put_part_request(
            &self,
            path: &str,
            part: u16,
            upload_id: &str,
            object: &[u8],
        ) -> Result<ByteBuffer> {
            let mut request = self.request(Method::Put, path);
            request
                .queries
                .insert("partNumber".into(), part.to_string());
            request.queries.insert("uploadId".into(), upload_id.into());
            request
                .headers
                .insert("Content-Length".into(), object.len().to_string());
            request.serialize()
        }

        fn complete_multipart_request(
            &self,
            path: &str,
            upload_id: &str,
            etags: &[String],
        ) -> Result<ByteBuffer> {
            let mut content = String::from("<CompleteMultipartUpload>\n");
            for (i, etag) in etags.iter().enumerate() {
                content.push_str(&format!(
                    "<Part>\n<PartNumber>{}</PartNumber>\n<ETag>\"{}\"</ETag>\n</Part>\n",
                    i + 1,
                    etag
                ));
            }
            content.push_str("</CompleteMultipartUpload>\n");
            let mut request = self.request(Method::Post, path);
            request.queries.insert("uploadId".into(), upload_id.into());
            request
                .headers
                .insert("Content-Length".into(), content.len().to_string());
            let mut bytes = request.serialize()?;
            bytes.extend_from_slice(content.as_bytes())?;
            Ok(bytes)
        }

        fn address(&self) -> String {
            "localhost".to_string()
        }

        fn port(&self) -> u16 {
            self.port
        }

        fn tls(&self) -> bool {
            false
        }

        fn multipart_upload_size(&self) -> u64 {
            self.multipart_size
        }
    }

    /// Minimal multipart-aware object endpoint: initiate answers with an
    /// UploadId, parts answer with an ETag, completion answers 200.
    fn multipart_server() -> (std::net::TcpListener, u16, Arc<AtomicU16>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let parts_seen = Arc::new(AtomicU16::new(0));
        let accept = listener.try_clone().unwrap();
        let counter = parts_seen.clone();
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = accept.accept() {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    let mut seen: Vec<u8> = Vec::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        // Read at least through the header.
                        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            match stream.read(&mut buf) {
                                Ok(0) | Err(_) => return,
                                Ok(n) => seen.extend_from_slice(&buf[..n]),
                            }
                        }
                        let head_end =
                            seen.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
                        let head = String::from_utf8_lossy(&seen[..head_end]).to_string();
                        let body_len = head
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        while seen.len() < head_end + body_len {
                            match stream.read(&mut buf) {
                                Ok(0) | Err(_) => return,
                                Ok(n) => seen.extend_from_slice(&buf[..n]),
                            }
                        }
                        seen.drain(..head_end + body_len);

                        let response = if head.contains("?uploads=") {
                            let body = "<InitiateMultipartUploadResult>\
                                 <UploadId>test-upload-1</UploadId>\
                                 </InitiateMultipartUploadResult>";
                            format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                                body.len(),
                                body
                            )
                        } else if head.contains("partNumber=") {
                            let n = counter.fetch_add(1, Ordering::Relaxed);
                            format!(
                                "HTTP/1.1 200 OK\r\nETag: \"etag-{n}\"\r\nContent-Length: 0\r\n\r\n"
                            )
                        } else if head.contains("uploadId=") {
                            let body = "<CompleteMultipartUploadResult></CompleteMultipartUploadResult>";
                            format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                                body.len(),
                                body
                            )
                        } else {
                            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string()
                        };
                        if stream.write_all(response.as_bytes()).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (listener, port, parts_seen)
    }

    #[test]
    fn small_put_stays_single_message() {
        let (_listener, port, _) = multipart_server();
        let provider = Arc::new(LocalProvider {
            port,
            multipart_size: 1 << 20,
        });
        let group = WorkerGroup::new(4, 16);
        let mut txn = Transaction::new(provider);

        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        txn.add_put_with_callback(
            "small.txt",
            Bytes::from_static(b"Hello World!"),
            Box::new(move |result| {
                assert!(result.success());
                seen.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        assert!(txn.process_async(&group));
        group.process().unwrap();
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert!(txn.multipart_uploads().is_empty());
    }

    #[test]
    fn multipart_put_walks_the_state_machine() {
        let (_listener, port, parts_seen) = multipart_server();
        let provider = Arc::new(LocalProvider {
            port,
            multipart_size: 64,
        });
        let group = WorkerGroup::new(8, 32);
        group.set_tcp_settings(TcpSettings {
            reuse: true,
            ..TcpSettings::default()
        });
        let mut txn = Transaction::new(provider);

        // 200 bytes over 64-byte parts: 3 full + 1 remainder.
        let blob = Bytes::from(vec![7u8; 200]);
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        txn.add_put_with_callback(
            "big.bin",
            blob,
            Box::new(move |result| {
                assert!(result.success());
                seen.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        // Pass 1: initiate. Pass 2: parts. Pass 3: completion.
        let mut passes = 0;
        while !txn.multiparts_done() {
            assert!(txn.process_async(&group));
            group.process().unwrap();
            passes += 1;
            assert!(passes < 10, "multipart upload did not converge");
        }

        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert_eq!(parts_seen.load(Ordering::Relaxed), 4);
        let record = txn.multipart_uploads()[0].lock().unwrap();
        assert_eq!(record.state, MultipartState::Default);
        assert!(record.done());
        assert_eq!(record.etags.len(), 4);
        assert!(record.etags.iter().all(|e| e.is_some()));
    }

    #[test]
    fn multipart_put_synchronously() {
        let (_listener, port, parts_seen) = multipart_server();
        let provider = Arc::new(LocalProvider {
            port,
            multipart_size: 100,
        });
        let group = WorkerGroup::new(8, 32);
        let mut txn = Transaction::new(provider);

        let blob = Bytes::from(vec![3u8; 250]);
        txn.add_put("sync.bin", blob).unwrap();

        let mut handle = group.get_handle().unwrap();
        txn.process_sync(&mut handle).unwrap();

        assert!(txn.multiparts_done());
        assert_eq!(parts_seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn get_and_delete_round_trip() {
        let (_listener, port, _) = multipart_server();
        let provider = Arc::new(LocalProvider {
            port,
            multipart_size: 0,
        });
        let group = WorkerGroup::new(4, 16);
        let mut txn = Transaction::new(provider);

        txn.add_get("obj.txt", None).unwrap();
        txn.add_delete("obj.txt").unwrap();
        assert!(txn.process_async(&group));
        group.process().unwrap();

        assert_eq!(txn.message_ids().len(), 2);
        for &id in txn.message_ids() {
            let msg = group.receive(id).expect("delivered");
            assert!(msg.result.success());
        }
    }

    #[test]
    fn find_xml_tag_extracts_upload_id() {
        let body = b"<r><UploadId>abc/def+1</UploadId></r>";
        assert_eq!(find_xml_tag(body, "UploadId").unwrap(), "abc/def+1");
        assert!(find_xml_tag(body, "Missing").is_none());
    }
}
