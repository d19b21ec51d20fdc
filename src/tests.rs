//! End-to-end loopback tests: a sender session and a receiver session on
//! two threads, joined by channel-backed pipes.

pub(crate) mod support {
    use std::collections::{HashMap, HashSet};
    use std::io::{self, Read, Write};
    use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::{
        FileAccept, FileHandler, FileInfo, FileOffer, Session, Transport, TransmissionError,
    };

    /// Handler for codec unit tests that never offers or accepts anything.
    struct NullHandler;

    impl FileHandler for NullHandler {
        fn next_file(&mut self) -> Option<FileOffer> {
            None
        }
        fn accept_file(&mut self, _info: &FileInfo) -> io::Result<FileAccept> {
            Ok(FileAccept::Skip)
        }
        fn file_completed(
            &mut self,
            _info: &FileInfo,
            _bytes: u64,
            _result: Result<(), TransmissionError>,
        ) {
        }
    }

    pub(crate) fn null_handler() -> Box<dyn FileHandler> {
        Box::new(NullHandler)
    }

    /// One end of a bidirectional in-memory link. Writes never block (the
    /// channel is unbounded); reads honor the session's read deadline via
    /// `recv_timeout`, mirroring a deadline-capable socket.
    pub(crate) struct ChannelPipe {
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
        deadline: Option<Duration>,
    }

    pub(crate) fn pipe_pair() -> (ChannelPipe, ChannelPipe) {
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        (
            ChannelPipe {
                tx: tx1,
                rx: rx2,
                pending: Vec::new(),
                deadline: None,
            },
            ChannelPipe {
                tx: tx2,
                rx: rx1,
                pending: Vec::new(),
                deadline: None,
            },
        )
    }

    impl Read for ChannelPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                let chunk = match self.deadline {
                    Some(d) => match self.rx.recv_timeout(d) {
                        Ok(chunk) => chunk,
                        Err(RecvTimeoutError::Timeout) => {
                            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                        }
                        Err(RecvTimeoutError::Disconnected) => return Ok(0),
                    },
                    None => match self.rx.recv() {
                        Ok(chunk) => chunk,
                        Err(_) => return Ok(0),
                    },
                };
                self.pending = chunk;
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    impl Write for ChannelPipe {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            // A dropped peer is fine: the session on that side is done.
            let _ = self.tx.send(data.to_vec());
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ChannelPipe {
        fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
            self.deadline = timeout;
            Ok(true)
        }
    }

    /// Drain whatever remains on this end without blocking.
    impl ChannelPipe {
        pub fn try_drain(&mut self) -> Vec<u8> {
            let mut out = std::mem::take(&mut self.pending);
            loop {
                match self.rx.try_recv() {
                    Ok(chunk) => out.extend(chunk),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => return out,
                }
            }
        }
    }

    /// How a file ended, flattened for assertions.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Outcome {
        Done,
        Skipped,
        NotSeekable,
        Failed(String),
    }

    #[derive(Default)]
    pub(crate) struct HandlerState {
        pub to_send: Vec<FileOffer>,
        pub received: HashMap<String, Arc<Mutex<Vec<u8>>>>,
        pub infos: HashMap<String, FileInfo>,
        pub completed: HashMap<String, Outcome>,
        pub progress: HashMap<String, u64>,
        pub accept_offset: u64,
        pub skip: HashSet<String>,
    }

    impl HandlerState {
        pub fn received_bytes(&self, name: &str) -> Option<Vec<u8>> {
            self.received
                .get(name)
                .map(|buf| buf.lock().unwrap().clone())
        }
    }

    /// Shared-state handler: both the session thread and the test body see
    /// the same `HandlerState`.
    #[derive(Clone)]
    pub(crate) struct TestHandler(pub Arc<Mutex<HandlerState>>);

    impl TestHandler {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(HandlerState::default())))
        }
    }

    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl FileHandler for TestHandler {
        fn next_file(&mut self) -> Option<FileOffer> {
            let mut state = self.0.lock().unwrap();
            if state.to_send.is_empty() {
                None
            } else {
                Some(state.to_send.remove(0))
            }
        }

        fn accept_file(&mut self, info: &FileInfo) -> io::Result<FileAccept> {
            let mut state = self.0.lock().unwrap();
            state.infos.insert(info.name.clone(), info.clone());
            if state.skip.contains(&info.name) {
                return Ok(FileAccept::Skip);
            }
            let buf = Arc::new(Mutex::new(Vec::new()));
            state.received.insert(info.name.clone(), buf.clone());
            let offset = state.accept_offset;
            Ok(FileAccept::Accept {
                sink: Box::new(SharedSink(buf)),
                offset,
            })
        }

        fn file_progress(&mut self, info: &FileInfo, bytes_transferred: u64) {
            self.0
                .lock()
                .unwrap()
                .progress
                .insert(info.name.clone(), bytes_transferred);
        }

        fn file_completed(
            &mut self,
            info: &FileInfo,
            _bytes_transferred: u64,
            result: Result<(), TransmissionError>,
        ) {
            let outcome = match result {
                Ok(()) => Outcome::Done,
                Err(TransmissionError::Skipped) => Outcome::Skipped,
                Err(TransmissionError::NotSeekable) => Outcome::NotSeekable,
                Err(err) => Outcome::Failed(err.to_string()),
            };
            self.0
                .lock()
                .unwrap()
                .completed
                .insert(info.name.clone(), outcome);
        }
    }

    /// Transport wrapper corrupting the bytes right after the Nth
    /// ZDLE+ZCRCG pair it sees go out, to force a CRC error downstream.
    pub(crate) struct CorruptingPipe {
        pub inner: ChannelPipe,
        pub target: usize,
        seen: usize,
        prev: u8,
        done: bool,
    }

    impl CorruptingPipe {
        pub fn new(inner: ChannelPipe, target: usize) -> Self {
            Self {
                inner,
                target,
                seen: 0,
                prev: 0,
                done: false,
            }
        }
    }

    impl Read for CorruptingPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for CorruptingPipe {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.done {
                return self.inner.write(data);
            }
            let mut buf = data.to_vec();
            let mut i = 0;
            while i < buf.len() {
                if self.prev == crate::ZDLE && buf[i] == crate::ZCRCG {
                    self.seen += 1;
                    if self.seen == self.target {
                        // Mangle the CRC bytes that follow (whatever part of
                        // them sits in this write).
                        for b in buf.iter_mut().skip(i + 1).take(4) {
                            *b ^= 0xff;
                        }
                        self.done = true;
                    }
                }
                self.prev = buf[i];
                i += 1;
            }
            self.inner.write(&buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Transport for CorruptingPipe {
        fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
            self.inner.set_read_deadline(timeout)
        }
    }

    /// Transport wrapper counting ZDLE+<marker> pairs in the outgoing
    /// stream.
    pub(crate) struct SnoopingPipe {
        pub inner: ChannelPipe,
        pub marker: u8,
        pub count: Arc<Mutex<usize>>,
        prev: u8,
    }

    impl SnoopingPipe {
        pub fn new(inner: ChannelPipe, marker: u8) -> Self {
            Self {
                inner,
                marker,
                count: Arc::new(Mutex::new(0)),
                prev: 0,
            }
        }
    }

    impl Read for SnoopingPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for SnoopingPipe {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            for &b in data {
                if self.prev == crate::ZDLE && b == self.marker {
                    *self.count.lock().unwrap() += 1;
                }
                self.prev = b;
            }
            self.inner.write(data)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Transport for SnoopingPipe {
        fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
            self.inner.set_read_deadline(timeout)
        }
    }

    /// Run a full sender/receiver loopback on two threads and wait for both
    /// to finish.
    pub(crate) fn run_loopback<A: Transport + 'static, B: Transport + 'static>(
        sender_transport: A,
        receiver_transport: B,
        sender_handler: TestHandler,
        receiver_handler: TestHandler,
        sender_cfg: crate::Config,
        receiver_cfg: crate::Config,
    ) {
        let mut sender = Session::new(sender_transport, Box::new(sender_handler), sender_cfg);
        let mut receiver =
            Session::new(receiver_transport, Box::new(receiver_handler), receiver_cfg);

        let send_thread = std::thread::spawn(move || sender.send(&crate::CancelToken::new()));
        let recv_thread = std::thread::spawn(move || receiver.receive(&crate::CancelToken::new()));

        let send_res = send_thread.join().expect("sender thread panicked");
        let recv_res = recv_thread.join().expect("receiver thread panicked");

        send_res.expect("sender error");
        recv_res.expect("receiver error");
    }
}

#[cfg(test)]
mod loopback {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use rand::RngCore;

    use super::support::*;
    use crate::{
        CancelToken, Config, EscapeMode, FileOffer, Session, TransmissionError, ABORT_SEQ, ZCRCQ,
    };

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn seekable_offer(name: &str, content: &[u8]) -> FileOffer {
        FileOffer::from_seekable(name, content.len() as u64, Cursor::new(content.to_vec()))
    }

    #[test]
    fn single_text_file_crc16() {
        let content = b"Hello, ZMODEM loopback test! This is a test file.";

        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![seekable_offer("test.txt", content)];
        let receiver = TestHandler::new();

        run_loopback(
            st,
            rt,
            sender.clone(),
            receiver.clone(),
            Config::default(),
            Config::default(),
        );

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("test.txt").unwrap(), content);
        assert_eq!(state.completed.get("test.txt"), Some(&Outcome::Done));
        assert_eq!(state.progress.get("test.txt"), Some(&(content.len() as u64)));
    }

    #[test]
    fn all_byte_values_both_crc_modes_and_escape_all() {
        let content: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

        for (use_crc32, escape_mode) in [
            (false, EscapeMode::Standard),
            (true, EscapeMode::Standard),
            (false, EscapeMode::All),
            (true, EscapeMode::All),
        ] {
            let (st, rt) = pipe_pair();
            let sender = TestHandler::new();
            sender.0.lock().unwrap().to_send = vec![seekable_offer("bytes.bin", &content)];
            let receiver = TestHandler::new();

            let cfg = Config {
                use_32bit_crc: use_crc32,
                escape_mode,
                ..Config::default()
            };
            run_loopback(st, rt, sender.clone(), receiver.clone(), cfg.clone(), cfg);

            let state = receiver.0.lock().unwrap();
            assert_eq!(
                state.received_bytes("bytes.bin").unwrap(),
                content,
                "crc32={use_crc32} escape={escape_mode:?}"
            );
        }
    }

    #[test]
    fn batch_of_three_files() {
        let content1 = b"First file content".to_vec();
        let content2 = random_bytes(4096);
        let content3 = b"Third file".to_vec();

        let mut f1 = seekable_offer("file1.txt", &content1);
        f1.files_remaining = 2;
        f1.bytes_remaining = (content2.len() + content3.len()) as u64;
        let mut f2 = seekable_offer("file2.bin", &content2);
        f2.files_remaining = 1;
        f2.bytes_remaining = content3.len() as u64;
        let f3 = seekable_offer("file3.dat", &content3);

        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![f1, f2, f3];
        let receiver = TestHandler::new();

        let cfg = Config {
            max_block_size: 512,
            ..Config::default()
        };
        run_loopback(st, rt, sender.clone(), receiver.clone(), cfg.clone(), cfg);

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("file1.txt").unwrap(), content1);
        assert_eq!(state.received_bytes("file2.bin").unwrap(), content2);
        assert_eq!(state.received_bytes("file3.dat").unwrap(), content3);

        // Batch hints count down across the batch.
        assert_eq!(state.infos["file1.txt"].files_remaining, 2);
        assert_eq!(state.infos["file2.bin"].files_remaining, 1);
        assert_eq!(state.infos["file3.dat"].files_remaining, 0);
    }

    #[test]
    fn receiver_skip_is_reported_to_sender() {
        let keep = b"keep this file content - it should be received".to_vec();

        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![
            seekable_offer("skip_me.txt", &[0u8; 100]),
            seekable_offer("keep_me.txt", &keep),
        ];
        let receiver = TestHandler::new();
        receiver.0.lock().unwrap().skip.insert("skip_me.txt".into());

        run_loopback(
            st,
            rt,
            sender.clone(),
            receiver.clone(),
            Config::default(),
            Config::default(),
        );

        let recv_state = receiver.0.lock().unwrap();
        assert!(recv_state.received_bytes("skip_me.txt").is_none());
        assert_eq!(recv_state.received_bytes("keep_me.txt").unwrap(), keep);

        let send_state = sender.0.lock().unwrap();
        assert_eq!(send_state.completed.get("skip_me.txt"), Some(&Outcome::Skipped));
        assert_eq!(send_state.completed.get("keep_me.txt"), Some(&Outcome::Done));
    }

    #[test]
    fn empty_file() {
        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![seekable_offer("empty.txt", &[])];
        let receiver = TestHandler::new();

        run_loopback(
            st,
            rt,
            sender.clone(),
            receiver.clone(),
            Config::default(),
            Config::default(),
        );

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("empty.txt").unwrap(), Vec::<u8>::new());
        assert_eq!(state.completed.get("empty.txt"), Some(&Outcome::Done));
    }

    #[test]
    fn large_file() {
        let content = random_bytes(65536);

        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![seekable_offer("large.bin", &content)];
        let receiver = TestHandler::new();

        run_loopback(
            st,
            rt,
            sender.clone(),
            receiver.clone(),
            Config::default(),
            Config::default(),
        );

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("large.bin").unwrap(), content);
    }

    #[test]
    fn mid_stream_corruption_recovers_via_zrpos() {
        let content = random_bytes(16384);

        let (st, rt) = pipe_pair();
        // Corrupt the CRC of the 3rd ZCRCG subpacket on the way out.
        let st = CorruptingPipe::new(st, 3);

        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![seekable_offer("corrupt_test.bin", &content)];
        let receiver = TestHandler::new();

        let cfg = Config {
            max_block_size: 512,
            use_32bit_crc: true,
            ..Config::default()
        };
        run_loopback(st, rt, sender.clone(), receiver.clone(), cfg.clone(), cfg);

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("corrupt_test.bin").unwrap(), content);
        assert_eq!(
            state.completed.get("corrupt_test.bin"),
            Some(&Outcome::Done)
        );
    }

    #[test]
    fn resume_from_offset() {
        let content = random_bytes(4096);

        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![seekable_offer("resume.bin", &content)];
        let receiver = TestHandler::new();
        receiver.0.lock().unwrap().accept_offset = 1024;

        let cfg = Config {
            max_block_size: 512,
            ..Config::default()
        };
        run_loopback(st, rt, sender.clone(), receiver.clone(), cfg.clone(), cfg);

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("resume.bin").unwrap(), &content[1024..]);
        assert_eq!(state.completed.get("resume.bin"), Some(&Outcome::Done));
    }

    #[test]
    fn non_seekable_offer_with_nonzero_zrpos_is_skipped() {
        let content1 = random_bytes(2048);
        let content2 = random_bytes(2048);

        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![
            FileOffer::from_reader(
                "nonseek.bin",
                content1.len() as u64,
                Cursor::new(content1),
            ),
            seekable_offer("seekable.bin", &content2),
        ];
        let receiver = TestHandler::new();
        receiver.0.lock().unwrap().accept_offset = 512;

        let cfg = Config {
            max_block_size: 512,
            ..Config::default()
        };
        run_loopback(st, rt, sender.clone(), receiver.clone(), cfg.clone(), cfg);

        let send_state = sender.0.lock().unwrap();
        assert_eq!(
            send_state.completed.get("nonseek.bin"),
            Some(&Outcome::NotSeekable)
        );

        let recv_state = receiver.0.lock().unwrap();
        assert_eq!(
            recv_state.completed.get("nonseek.bin"),
            Some(&Outcome::Skipped)
        );
        assert_eq!(
            recv_state.received_bytes("nonseek.bin").unwrap(),
            Vec::<u8>::new()
        );
        // The seekable file still goes through, from offset 512 on.
        assert_eq!(
            recv_state.received_bytes("seekable.bin").unwrap(),
            &content2[512..]
        );
    }

    #[test]
    fn max_file_size_rejects_oversize() {
        let small = b"small file content here".to_vec();
        let big = random_bytes(5000);
        let medium = b"medium file - should be received just fine!!".to_vec();

        let (st, rt) = pipe_pair();
        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![
            seekable_offer("small.txt", &small),
            seekable_offer("big.bin", &big),
            seekable_offer("medium.txt", &medium),
        ];
        let receiver = TestHandler::new();

        run_loopback(
            st,
            rt,
            sender.clone(),
            receiver.clone(),
            Config::default(),
            Config {
                max_file_size: 1000,
                ..Config::default()
            },
        );

        let recv_state = receiver.0.lock().unwrap();
        assert_eq!(recv_state.received_bytes("small.txt").unwrap(), small);
        assert_eq!(recv_state.received_bytes("medium.txt").unwrap(), medium);
        assert!(recv_state.received_bytes("big.bin").is_none());

        let send_state = sender.0.lock().unwrap();
        assert_eq!(send_state.completed.get("big.bin"), Some(&Outcome::Skipped));
    }

    #[test]
    fn receive_times_out_against_a_silent_peer() {
        let (transport, _other_end) = pipe_pair();

        let handler = TestHandler::new();
        let cfg = Config {
            recv_timeout: Some(Duration::from_millis(50)),
            ..Config::default()
        };
        let mut session = Session::new(transport, Box::new(handler), cfg);

        let start = Instant::now();
        let err = session
            .receive(&CancelToken::new())
            .expect_err("expected timeout");
        let elapsed = start.elapsed();

        assert!(
            matches!(
                err,
                TransmissionError::MaxRetriesExceeded(_) | TransmissionError::Timeout
            ),
            "unexpected error: {err}"
        );
        assert!(elapsed < Duration::from_secs(5), "took too long: {elapsed:?}");
    }

    #[test]
    fn zcrcq_checkpoints_appear_in_the_stream() {
        let content = random_bytes(32768);

        let (st, rt) = pipe_pair();
        let st = SnoopingPipe::new(st, ZCRCQ);
        let zcrcq_count = Arc::clone(&st.count);

        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![seekable_offer("zcrcq_test.bin", &content)];
        let receiver = TestHandler::new();

        let cfg = Config {
            max_block_size: 512,
            ..Config::default()
        };
        run_loopback(st, rt, sender.clone(), receiver.clone(), cfg.clone(), cfg);

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("zcrcq_test.bin").unwrap(), content);
        assert!(
            *zcrcq_count.lock().unwrap() > 0,
            "expected at least one ZCRCQ checkpoint"
        );
    }

    #[test]
    fn window_flow_control() {
        let content = random_bytes(8192);

        let (st, rt) = pipe_pair();
        // The window gate solicits ZACKs with zero-length ZCRCQ subpackets;
        // seeing them proves the sender stalled at the boundary.
        let st = SnoopingPipe::new(st, ZCRCQ);
        let zcrcq_count = Arc::clone(&st.count);

        let sender = TestHandler::new();
        sender.0.lock().unwrap().to_send = vec![seekable_offer("window_test.bin", &content)];
        let receiver = TestHandler::new();

        run_loopback(
            st,
            rt,
            sender.clone(),
            receiver.clone(),
            Config {
                max_block_size: 512,
                ..Config::default()
            },
            Config {
                max_block_size: 512,
                window_size: 2048,
                ..Config::default()
            },
        );

        let state = receiver.0.lock().unwrap();
        assert_eq!(state.received_bytes("window_test.bin").unwrap(), content);
        assert!(
            *zcrcq_count.lock().unwrap() > 0,
            "expected window-gate checkpoints"
        );
    }

    #[test]
    fn abort_writes_the_cancel_sequence() {
        let (transport, mut other_end) = pipe_pair();
        let mut session = Session::new(transport, null_handler(), Config::default());

        session.abort().unwrap();
        assert_eq!(other_end.try_drain(), ABORT_SEQ);
    }

    #[test]
    fn cancelled_token_stops_the_session() {
        let (transport, _other_end) = pipe_pair();
        let mut session = Session::new(transport, null_handler(), Config::default());

        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            session.receive(&cancel),
            Err(TransmissionError::Cancelled)
        ));
        // A fresh call on the same session works again.
        assert!(matches!(
            session.send(&cancel),
            Err(TransmissionError::Cancelled)
        ));
    }
}
