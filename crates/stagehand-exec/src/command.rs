//! Handle tracking a single command invocation
//!
//! A [`CommandHandle`] is shared between the caller of `execute`, any number
//! of waiters, and the background task driving the transport. Completion is a
//! single-assignment cell: the first `complete` wins and wakes every waiter,
//! a second one is a bug and panics.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::ExecError;

/// Terminal state of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Process exited with a status code
    Exited(i32),
    /// Process was terminated by a signal (name without the `SIG` prefix)
    Signaled(String),
    /// Driving the command failed locally
    Errored(ExecError),
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Turns raw output bytes into text for one stream of a command
///
/// Chunks may end in the middle of a UTF-8 sequence; the incomplete tail is
/// held back until the next chunk. Only bytes that can never be valid become
/// U+FFFD.
#[derive(Debug)]
pub(crate) struct OutputDecoder {
    stream: Stream,
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub(crate) fn new(stream: Stream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    /// Decode `bytes` and append whatever is complete to `command`
    pub(crate) fn feed(&mut self, command: &CommandHandle, bytes: &[u8]) {
        let text = self.decode(bytes);
        self.emit(command, &text);
    }

    /// Append any held-back bytes, lossily
    pub(crate) fn flush(&mut self, command: &CommandHandle) {
        if self.pending.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        self.emit(command, &text);
    }

    fn emit(&self, command: &CommandHandle, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.stream {
            Stream::Stdout => command.add_stdout(text),
            Stream::Stderr => command.add_stderr(text),
        };
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // incomplete sequence at the end
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        text
    }
}

type OutputListener = Arc<dyn Fn(&str, Stream) + Send + Sync>;
type StreamListener = Arc<dyn Fn(&str) + Send + Sync>;
type SendHandler = Arc<dyn Fn(&str) + Send + Sync>;
type EofHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Output {
    stdout: String,
    stderr: String,
    output_listeners: Vec<OutputListener>,
    stdout_listeners: Vec<StreamListener>,
    stderr_listeners: Vec<StreamListener>,
}

#[derive(Default)]
struct Input {
    send: Option<SendHandler>,
    eof: Option<EofHandler>,
}

struct Shared {
    script: String,
    completion: watch::Sender<Option<Outcome>>,
    output: Mutex<Output>,
    input: Mutex<Input>,
}

/// Shared handle to one command's lifecycle, output and completion
///
/// Cloning is cheap; all clones observe the same command.
#[derive(Clone)]
pub struct CommandHandle {
    shared: Arc<Shared>,
}

impl CommandHandle {
    /// Create a pending handle for `script`
    pub fn new(script: impl Into<String>) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                script: script.into(),
                completion,
                output: Mutex::new(Output::default()),
                input: Mutex::new(Input::default()),
            }),
        }
    }

    /// Script text this handle runs
    pub fn script(&self) -> &str {
        &self.shared.script
    }

    /// Wait until the command reaches a terminal state
    ///
    /// Returns immediately when already complete. Any number of tasks may
    /// wait concurrently; each resumes exactly once.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.shared.completion.subscribe();
        // The sender lives in `shared`, which `self` keeps alive, so the
        // receiver can only finish by observing a value.
        if let Ok(outcome) = rx.wait_for(Option::is_some).await {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
        }
        unreachable!("completion sender dropped while a handle is alive")
    }

    /// Wait, then turn the outcome into a `Result`
    ///
    /// # Errors
    /// Returns the stored error unchanged for `Errored`, and
    /// `ExecError::CommandFailed` for a signal or a non-zero exit status.
    pub async fn value(&self) -> Result<(), ExecError> {
        match self.wait().await {
            Outcome::Exited(0) => Ok(()),
            Outcome::Exited(status) => Err(ExecError::CommandFailed {
                script: self.shared.script.clone(),
                signal: None,
                status: Some(status),
            }),
            Outcome::Signaled(name) => Err(ExecError::CommandFailed {
                script: self.shared.script.clone(),
                signal: Some(name),
                status: None,
            }),
            Outcome::Errored(err) => Err(err),
        }
    }

    /// Record the terminal state and wake all waiters
    ///
    /// # Panics
    /// Panics if the command was already completed.
    pub fn complete(&self, outcome: Outcome) {
        let completed = self.try_complete(outcome);
        assert!(
            completed,
            "command already completed (possible bug): {:?}",
            self.shared.script
        );
        debug!(script = %self.shared.script, outcome = ?self.outcome(), "command completed");
    }

    /// Complete with `Errored(err)` unless a terminal state is already set
    ///
    /// Returns whether this call completed the command.
    pub fn complete_with_error(&self, err: ExecError) -> bool {
        let completed = self.try_complete(Outcome::Errored(err));
        if !completed {
            trace!(script = %self.shared.script, "error after completion ignored");
        }
        completed
    }

    fn try_complete(&self, outcome: Outcome) -> bool {
        self.shared.completion.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Current terminal state, if any
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.completion.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completion.borrow().is_some()
    }

    pub fn is_exited(&self) -> bool {
        matches!(*self.shared.completion.borrow(), Some(Outcome::Exited(_)))
    }

    pub fn is_signaled(&self) -> bool {
        matches!(*self.shared.completion.borrow(), Some(Outcome::Signaled(_)))
    }

    pub fn is_error(&self) -> bool {
        matches!(*self.shared.completion.borrow(), Some(Outcome::Errored(_)))
    }

    /// Exited with status 0
    pub fn is_success(&self) -> bool {
        matches!(*self.shared.completion.borrow(), Some(Outcome::Exited(0)))
    }

    pub fn exit_status(&self) -> Option<i32> {
        match *self.shared.completion.borrow() {
            Some(Outcome::Exited(status)) => Some(status),
            _ => None,
        }
    }

    pub fn term_signal(&self) -> Option<String> {
        match &*self.shared.completion.borrow() {
            Some(Outcome::Signaled(name)) => Some(name.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<ExecError> {
        match &*self.shared.completion.borrow() {
            Some(Outcome::Errored(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Everything written to stdout so far
    pub fn stdout(&self) -> String {
        self.shared.output.lock().stdout.clone()
    }

    /// Everything written to stderr so far
    pub fn stderr(&self) -> String {
        self.shared.output.lock().stderr.clone()
    }

    /// Register a listener for stdout chunks
    pub fn on_stdout<F>(&self, listener: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.output.lock().stdout_listeners.push(Arc::new(listener));
        self
    }

    /// Register a listener for stderr chunks
    pub fn on_stderr<F>(&self, listener: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.output.lock().stderr_listeners.push(Arc::new(listener));
        self
    }

    /// Register a listener for chunks from both streams
    pub fn on_output<F>(&self, listener: F) -> &Self
    where
        F: Fn(&str, Stream) + Send + Sync + 'static,
    {
        self.shared.output.lock().output_listeners.push(Arc::new(listener));
        self
    }

    /// Append a stdout chunk and notify listeners
    pub fn add_stdout(&self, chunk: &str) -> &Self {
        self.deliver(chunk, Stream::Stdout);
        self
    }

    /// Append a stderr chunk and notify listeners
    pub fn add_stderr(&self, chunk: &str) -> &Self {
        self.deliver(chunk, Stream::Stderr);
        self
    }

    // Listeners run outside the lock, on a snapshot taken together with the
    // append, so a listener never sees a chunk delivered before it registered.
    fn deliver(&self, chunk: &str, stream: Stream) {
        let (output_listeners, stream_listeners) = {
            let mut output = self.shared.output.lock();
            let stream_listeners = match stream {
                Stream::Stdout => {
                    output.stdout.push_str(chunk);
                    output.stdout_listeners.clone()
                }
                Stream::Stderr => {
                    output.stderr.push_str(chunk);
                    output.stderr_listeners.clone()
                }
            };
            (output.output_listeners.clone(), stream_listeners)
        };

        for listener in &output_listeners {
            listener(chunk, stream);
        }
        for listener in &stream_listeners {
            listener(chunk);
        }
    }

    /// Forward each string, in order, to the input handler
    pub fn send<I, S>(&self, strings: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let handler = self.shared.input.lock().send.clone();
        let Some(handler) = handler else {
            return;
        };
        for string in strings {
            handler(string.as_ref());
        }
    }

    /// Close the command's input
    pub fn signal_eof(&self) {
        let handler = self.shared.input.lock().eof.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Replace the handler receiving strings passed to [`send`](Self::send)
    pub fn set_send_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.input.lock().send = Some(Arc::new(handler));
    }

    /// Replace the handler invoked by [`signal_eof`](Self::signal_eof)
    pub fn set_eof_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.input.lock().eof = Some(Arc::new(handler));
    }
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandle")
            .field("script", &self.shared.script)
            .field("outcome", &*self.shared.completion.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Arc::clone(&log), log)
    }

    #[test]
    fn test_pending_statuses() {
        let cmd = CommandHandle::new("echo hi");

        assert!(!cmd.is_completed());
        assert!(!cmd.is_exited());
        assert!(!cmd.is_signaled());
        assert!(!cmd.is_success());
        assert!(!cmd.is_error());
        assert_eq!(cmd.outcome(), None);
    }

    #[test]
    fn test_exited_success_statuses() {
        let cmd = CommandHandle::new("echo hi");
        cmd.complete(Outcome::Exited(0));

        assert!(cmd.is_completed());
        assert!(cmd.is_exited());
        assert!(!cmd.is_signaled());
        assert!(cmd.is_success());
        assert!(!cmd.is_error());
        assert_eq!(cmd.exit_status(), Some(0));
    }

    #[test]
    fn test_exited_failure_statuses() {
        let cmd = CommandHandle::new("false");
        cmd.complete(Outcome::Exited(1));

        assert!(cmd.is_completed());
        assert!(cmd.is_exited());
        assert!(!cmd.is_success());
    }

    #[test]
    fn test_signaled_statuses() {
        let cmd = CommandHandle::new("sleep 100");
        cmd.complete(Outcome::Signaled("KILL".to_string()));

        assert!(cmd.is_completed());
        assert!(!cmd.is_exited());
        assert!(cmd.is_signaled());
        assert!(!cmd.is_success());
        assert_eq!(cmd.term_signal().as_deref(), Some("KILL"));
    }

    #[test]
    fn test_errored_statuses() {
        let cmd = CommandHandle::new("echo hi");
        cmd.complete(Outcome::Errored(ExecError::ChannelClosed));

        assert!(cmd.is_completed());
        assert!(cmd.is_error());
        assert!(!cmd.is_exited());
        assert!(!cmd.is_success());
        assert_eq!(cmd.error(), Some(ExecError::ChannelClosed));
    }

    #[test]
    #[should_panic(expected = "already completed")]
    fn test_complete_twice_panics() {
        let cmd = CommandHandle::new("echo hi");
        cmd.complete(Outcome::Exited(0));
        cmd.complete(Outcome::Exited(1));
    }

    #[test]
    fn test_rejected_completion_leaves_first_outcome() {
        let cmd = CommandHandle::new("echo hi");
        cmd.complete(Outcome::Signaled("TERM".to_string()));

        let second = cmd.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            second.complete(Outcome::Exited(0));
        }));

        assert!(result.is_err());
        assert_eq!(cmd.outcome(), Some(Outcome::Signaled("TERM".to_string())));
    }

    #[test]
    fn test_complete_with_error_keeps_first_outcome() {
        let cmd = CommandHandle::new("echo hi");
        cmd.complete(Outcome::Exited(0));

        assert!(!cmd.complete_with_error(ExecError::ChannelClosed));
        assert!(cmd.is_success());
    }

    #[tokio::test]
    async fn test_value_reraises_error_unchanged() {
        let cmd = CommandHandle::new("echo hi");
        let err = ExecError::IoError("connection reset".to_string());
        cmd.complete(Outcome::Errored(err.clone()));

        assert_eq!(cmd.value().await, Err(err));
    }

    #[tokio::test]
    async fn test_value_signaled() {
        let cmd = CommandHandle::new("sleep 100");
        cmd.complete(Outcome::Signaled("KILL".to_string()));

        let err = cmd.value().await.unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ExecError::CommandFailed { .. }));
        assert!(message.contains("signal=KILL"));
        assert!(message.contains("sleep 100"));
    }

    #[tokio::test]
    async fn test_value_failed_status() {
        let cmd = CommandHandle::new("exit 1");
        cmd.complete(Outcome::Exited(1));

        let message = cmd.value().await.unwrap_err().to_string();
        assert!(message.contains("status=1"));
        assert!(message.contains("exit 1"));
    }

    #[tokio::test]
    async fn test_value_success() {
        let cmd = CommandHandle::new("true");
        cmd.complete(Outcome::Exited(0));

        assert_eq!(cmd.value().await, Ok(()));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_completed() {
        let cmd = CommandHandle::new("echo hi");
        cmd.complete(Outcome::Exited(0));

        let waits = (0..8).map(|_| {
            let cmd = cmd.clone();
            tokio::spawn(async move { cmd.wait().await })
        });
        for wait in waits {
            let outcome = tokio::time::timeout(Duration::from_secs(1), wait)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome, Outcome::Exited(0));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_unblocks_on_completion() {
        let cmd = CommandHandle::new("echo hi");

        let waiter = {
            let cmd = cmd.clone();
            tokio::spawn(async move {
                cmd.wait().await;
                cmd.is_success()
            })
        };

        let completer = {
            let cmd = cmd.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cmd.complete(Outcome::Exited(0));
            })
        };

        let success = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        completer.await.unwrap();
        assert!(success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_waiters_resume_once() {
        let cmd = CommandHandle::new("echo hi");
        let resumed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let cmd = cmd.clone();
                let resumed = Arc::clone(&resumed);
                tokio::spawn(async move {
                    cmd.wait().await;
                    resumed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        cmd.complete(Outcome::Exited(3));

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(resumed.load(std::sync::atomic::Ordering::SeqCst), 16);
    }

    #[test]
    fn test_output_listener_order() {
        let cmd = CommandHandle::new("echo hi");
        let (output, output_log) = recorder::<(String, Stream)>();
        let (stdout, stdout_log) = recorder::<String>();
        let (stderr, stderr_log) = recorder::<String>();

        cmd.on_output(move |chunk, stream| output.lock().push((chunk.to_string(), stream)));
        cmd.on_stdout(move |chunk| stdout.lock().push(chunk.to_string()));
        cmd.on_stderr(move |chunk| stderr.lock().push(chunk.to_string()));

        cmd.add_stdout("a").add_stderr("b");

        assert_eq!(
            *output_log.lock(),
            vec![
                ("a".to_string(), Stream::Stdout),
                ("b".to_string(), Stream::Stderr)
            ]
        );
        assert_eq!(*stdout_log.lock(), vec!["a".to_string()]);
        assert_eq!(*stderr_log.lock(), vec!["b".to_string()]);
        assert_eq!(cmd.stdout(), "a");
        assert_eq!(cmd.stderr(), "b");
    }

    #[test]
    fn test_output_listeners_run_before_stream_listeners() {
        let cmd = CommandHandle::new("echo hi");
        let (calls, log) = recorder::<&'static str>();

        let stream_calls = Arc::clone(&calls);
        cmd.on_stdout(move |_| stream_calls.lock().push("stdout"));
        let first = Arc::clone(&calls);
        cmd.on_output(move |_, _| first.lock().push("output-1"));
        cmd.on_output(move |_, _| calls.lock().push("output-2"));

        cmd.add_stdout("x");

        assert_eq!(*log.lock(), vec!["output-1", "output-2", "stdout"]);
    }

    #[test]
    fn test_late_listener_misses_earlier_chunks() {
        let cmd = CommandHandle::new("echo hi");
        cmd.add_stdout("early ");

        let (seen, log) = recorder::<String>();
        cmd.on_stdout(move |chunk| seen.lock().push(chunk.to_string()));
        cmd.add_stdout("late");

        assert_eq!(*log.lock(), vec!["late".to_string()]);
        assert_eq!(cmd.stdout(), "early late");
    }

    #[test]
    fn test_stdout_independent_of_stderr_interleaving() {
        let cmd = CommandHandle::new("build");
        let chunks = [
            (Stream::Stdout, "1"),
            (Stream::Stderr, "w1"),
            (Stream::Stderr, "w2"),
            (Stream::Stdout, "2"),
            (Stream::Stdout, "3"),
            (Stream::Stderr, "w3"),
            (Stream::Stdout, "4"),
        ];

        for (stream, chunk) in chunks {
            match stream {
                Stream::Stdout => cmd.add_stdout(chunk),
                Stream::Stderr => cmd.add_stderr(chunk),
            };
        }

        assert_eq!(cmd.stdout(), "1234");
        assert_eq!(cmd.stderr(), "w1w2w3");
    }

    #[test]
    fn test_send_and_eof_default_to_noop() {
        let cmd = CommandHandle::new("cat");

        cmd.send(["ignored"]);
        cmd.signal_eof();
    }

    #[test]
    fn test_send_forwards_in_order() {
        let cmd = CommandHandle::new("cat");
        let (sent, log) = recorder::<String>();
        let eof = Arc::new(std::sync::atomic::AtomicBool::new(false));

        cmd.set_send_handler(move |s| sent.lock().push(s.to_string()));
        let eof_flag = Arc::clone(&eof);
        cmd.set_eof_handler(move || eof_flag.store(true, std::sync::atomic::Ordering::SeqCst));

        cmd.send(["one", "two"]);
        cmd.send(vec![String::from("three")]);
        cmd.signal_eof();

        assert_eq!(*log.lock(), vec!["one", "two", "three"]);
        assert!(eof.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_send_handler_is_replaceable() {
        let cmd = CommandHandle::new("cat");
        let (first, first_log) = recorder::<String>();
        let (second, second_log) = recorder::<String>();

        cmd.set_send_handler(move |s| first.lock().push(s.to_string()));
        cmd.send(["a"]);
        cmd.set_send_handler(move |s| second.lock().push(s.to_string()));
        cmd.send(["b"]);

        assert_eq!(*first_log.lock(), vec!["a"]);
        assert_eq!(*second_log.lock(), vec!["b"]);
    }

    #[test]
    fn test_decoder_joins_split_character() {
        let cmd = CommandHandle::new("printf");
        let (chunks, log) = recorder::<String>();
        cmd.on_stdout(move |chunk| chunks.lock().push(chunk.to_string()));
        let mut decoder = OutputDecoder::new(Stream::Stdout);

        let bytes = "caf\u{e9}".as_bytes();
        decoder.feed(&cmd, &bytes[..4]);
        decoder.feed(&cmd, &bytes[4..]);

        assert_eq!(cmd.stdout(), "caf\u{e9}");
        assert_eq!(*log.lock(), vec!["caf", "\u{e9}"]);
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes_only() {
        let cmd = CommandHandle::new("printf");
        let mut decoder = OutputDecoder::new(Stream::Stderr);

        decoder.feed(&cmd, b"a\xffb\xe2\x82");
        assert_eq!(cmd.stderr(), "a\u{fffd}b");

        decoder.feed(&cmd, b"\xac!");
        assert_eq!(cmd.stderr(), "a\u{fffd}b\u{20ac}!");
    }

    #[test]
    fn test_decoder_flushes_truncated_tail() {
        let cmd = CommandHandle::new("printf");
        let mut decoder = OutputDecoder::new(Stream::Stdout);

        decoder.feed(&cmd, b"ok\xc3");
        assert_eq!(cmd.stdout(), "ok");

        decoder.flush(&cmd);
        assert_eq!(cmd.stdout(), "ok\u{fffd}");
    }
}
