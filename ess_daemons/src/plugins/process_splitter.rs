use crate::registry::plugin_settings;
use async_trait::async_trait;
use ess_lib::{Content, EssError, EssResult, SplitOutput, Splitter};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessSplitterSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Ranges handed to the child and not answered yet.
    pub max_pending: usize,
    pub max_attempts: u32,
    pub channel_size: usize,
    pub stop_timeout_secs: u64,
}

impl Default for ProcessSplitterSettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            max_pending: 8,
            max_attempts: 3,
            channel_size: 64,
            stop_timeout_secs: 10,
        }
    }
}

/// One line written to the child's stdin.
#[derive(Debug, Clone, Serialize)]
struct SplitRequestLine {
    content_id: i64,
    coll_id: i64,
    scope: String,
    name: String,
    min_id: u64,
    max_id: u64,
    pfn: Option<String>,
    priority: i32,
}

impl SplitRequestLine {
    fn from_content(content: &Content) -> Self {
        Self {
            content_id: content.content_id,
            coll_id: content.coll_id,
            scope: content.scope.clone(),
            name: content.name.clone(),
            min_id: content.min_id,
            max_id: content.max_id,
            pfn: content.pfn.clone(),
            priority: content.priority,
        }
    }
}

/// One line read from the child's stdout: either a location or an error.
#[derive(Debug, Clone, Deserialize)]
struct SplitReplyLine {
    content_id: i64,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    pfn: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Default)]
struct SplitterShared {
    in_flight: Mutex<HashMap<i64, (Content, u32)>>,
    outputs: Mutex<VecDeque<SplitOutput>>,
    running: AtomicBool,
}

impl SplitterShared {
    fn push_output(&self, output: SplitOutput) {
        match self.outputs.lock() {
            Ok(mut outputs) => outputs.push_back(output),
            Err(e) => error!("process splitter: outputs lock poisoned: {}", e),
        }
    }

    /// Turns every unanswered range into a failed output.
    fn fail_in_flight(&self, reason: &str) -> usize {
        let abandoned = match self.in_flight.lock() {
            Ok(mut in_flight) => in_flight.drain().map(|(_, (content, _))| content).collect::<Vec<_>>(),
            Err(e) => {
                error!("process splitter: in-flight lock poisoned: {}", e);
                return 0;
            }
        };
        for content in abandoned.iter() {
            self.push_output(SplitOutput::failed(content, reason));
        }
        abandoned.len()
    }

    fn in_flight_len(&self) -> usize {
        match self.in_flight.lock() {
            Ok(in_flight) => in_flight.len(),
            Err(e) => {
                error!("process splitter: in-flight lock poisoned: {}", e);
                usize::MAX
            }
        }
    }

    fn outputs_len(&self) -> usize {
        match self.outputs.lock() {
            Ok(outputs) => outputs.len(),
            Err(e) => {
                error!("process splitter: outputs lock poisoned: {}", e);
                0
            }
        }
    }

    fn handle_reply(
        &self,
        line: &str,
        retry_tx: &mpsc::Sender<SplitRequestLine>,
        max_attempts: u32,
    ) {
        let reply: SplitReplyLine = match serde_json::from_str(line.trim()) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("process splitter: unreadable reply ignored: line={}, err={}", line, e);
                return;
            }
        };

        let mut in_flight = match self.in_flight.lock() {
            Ok(in_flight) => in_flight,
            Err(e) => {
                error!("process splitter: in-flight lock poisoned: {}", e);
                return;
            }
        };
        let Some((content, attempts)) = in_flight.remove(&reply.content_id) else {
            warn!(
                "process splitter: reply for unknown range: content_id={}",
                reply.content_id
            );
            return;
        };

        if let (None, Some(pfn)) = (&reply.error, &reply.pfn) {
            drop(in_flight);
            self.push_output(SplitOutput::done(&content, pfn.clone(), reply.size));
            return;
        }

        let reason = reply
            .error
            .unwrap_or_else(|| "reply without pfn".to_string());
        if attempts >= max_attempts {
            error!(
                "process splitter: range failed, giving up: content_id={}, attempts={}, reason={}",
                content.content_id, attempts, reason
            );
            drop(in_flight);
            self.push_output(SplitOutput::failed(
                &content,
                format!("gave up after {} attempts: {}", attempts, reason),
            ));
            return;
        }
        warn!(
            "process splitter: range failed, resending: content_id={}, attempt={}, reason={}",
            content.content_id, attempts, reason
        );
        let line = SplitRequestLine::from_content(&content);
        in_flight.insert(content.content_id, (content, attempts + 1));
        if let Err(e) = retry_tx.try_send(line) {
            error!("process splitter: resend failed: {}", e);
            if let Some((content, _)) = in_flight.remove(&reply.content_id) {
                drop(in_flight);
                self.push_output(SplitOutput::failed(&content, format!("resend failed: {}", e)));
            }
        }
    }
}

struct ChildHandle {
    child: Child,
    requests: mpsc::Sender<SplitRequestLine>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Drives a long-lived child process that splits ranges. Each request and each reply
/// is one JSON object per line over the child's stdin/stdout.
pub struct ProcessSplitter {
    settings: ProcessSplitterSettings,
    shared: Arc<SplitterShared>,
    child: AsyncMutex<Option<ChildHandle>>,
}

impl ProcessSplitter {
    pub fn new(settings: ProcessSplitterSettings) -> EssResult<Self> {
        if settings.command.trim().is_empty() {
            return Err(EssError::InvalidParam(
                "process splitter needs a command".to_string(),
            ));
        }
        Ok(Self {
            settings,
            shared: Arc::new(SplitterShared::default()),
            child: AsyncMutex::new(None),
        })
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        Self::new(plugin_settings("process", settings)?)
    }
}

async fn write_requests(mut stdin: ChildStdin, mut requests: mpsc::Receiver<SplitRequestLine>) {
    while let Some(request) = requests.recv().await {
        let mut line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                error!("process splitter: encode request failed: {}", e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!("process splitter: write to child failed: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("process splitter: flush to child failed: {}", e);
            break;
        }
    }
    debug!("process splitter: writer finished");
}

async fn read_replies(
    stdout: ChildStdout,
    shared: Arc<SplitterShared>,
    retry_tx: mpsc::Sender<SplitRequestLine>,
    max_attempts: u32,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => shared.handle_reply(&line, &retry_tx, max_attempts),
            Ok(None) => {
                info!("process splitter: child closed its output");
                break;
            }
            Err(e) => {
                error!("process splitter: read from child failed: {}", e);
                break;
            }
        }
    }
    let failed = shared.fail_in_flight("splitter child exited");
    shared.running.store(false, Ordering::SeqCst);
    error!(
        "process splitter: child is gone, unanswered ranges failed: count={}",
        failed
    );
}

#[async_trait]
impl Splitter for ProcessSplitter {
    async fn start(&self) -> EssResult<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.settings.command)
            .args(&self.settings.args)
            .envs(&self.settings.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(
                    "process splitter: spawn failed: command={}, err={}",
                    self.settings.command, e
                );
                EssError::PluginExecution(format!("spawn {}: {}", self.settings.command, e))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EssError::Internal("child stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EssError::Internal("child stdout not piped".to_string()))?;

        let (tx, rx) = mpsc::channel(self.settings.channel_size.max(1));
        let writer = tokio::spawn(write_requests(stdin, rx));
        let reader = tokio::spawn(read_replies(
            stdout,
            self.shared.clone(),
            tx.clone(),
            self.settings.max_attempts.max(1),
        ));
        self.shared.running.store(true, Ordering::SeqCst);
        info!(
            "process splitter: child started: pid={:?}, command={}",
            child.id(),
            self.settings.command
        );
        *guard = Some(ChildHandle {
            child,
            requests: tx,
            writer,
            reader,
        });
        Ok(())
    }

    async fn stop(&self) -> EssResult<()> {
        let Some(handle) = self.child.lock().await.take() else {
            return Ok(());
        };
        let ChildHandle {
            mut child,
            requests,
            writer,
            reader,
        } = handle;
        let timeout = Duration::from_secs(self.settings.stop_timeout_secs);

        // The reader holds a sender for resends; stdin only closes once every sender is gone.
        reader.abort();
        self.shared.running.store(false, Ordering::SeqCst);
        drop(requests);
        if tokio::time::timeout(timeout, writer).await.is_err() {
            warn!("process splitter: writer did not finish within {:?}", timeout);
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => info!("process splitter: child exited: status={}", status),
            Ok(Err(e)) => warn!("process splitter: wait for child failed: {}", e),
            Err(_) => {
                warn!("process splitter: child did not exit within {:?}, killing", timeout);
                child
                    .kill()
                    .await
                    .map_err(|e| EssError::PluginExecution(format!("kill splitter: {}", e)))?;
            }
        }

        let abandoned = self.shared.in_flight_len();
        if abandoned > 0 {
            warn!("process splitter: {} ranges left unanswered", abandoned);
        }
        Ok(())
    }

    fn need_more_requests(&self) -> bool {
        self.is_running() && self.shared.in_flight_len() < self.settings.max_pending
    }

    async fn send_requests(&self, contents: &[Content]) -> EssResult<()> {
        let sender = match self.child.lock().await.as_ref() {
            Some(handle) if self.is_running() => handle.requests.clone(),
            _ => {
                return Err(EssError::PluginExecution(
                    "process splitter is not running".to_string(),
                ))
            }
        };

        for content in contents {
            {
                let mut in_flight = self.shared.in_flight.lock().map_err(|e| {
                    EssError::Internal(format!("splitter in-flight lock poisoned: {}", e))
                })?;
                in_flight.insert(content.content_id, (content.clone(), 1));
            }
            if sender
                .send(SplitRequestLine::from_content(content))
                .await
                .is_err()
            {
                if let Ok(mut in_flight) = self.shared.in_flight.lock() {
                    in_flight.remove(&content.content_id);
                }
                return Err(EssError::PluginExecution(
                    "process splitter request channel closed".to_string(),
                ));
            }
        }
        debug!("process splitter: {} ranges sent", contents.len());
        Ok(())
    }

    fn has_outputs(&self) -> bool {
        self.shared.outputs_len() > 0
    }

    async fn get_outputs(&self) -> EssResult<Vec<SplitOutput>> {
        let mut outputs = self
            .shared
            .outputs
            .lock()
            .map_err(|e| EssError::Internal(format!("splitter outputs lock poisoned: {}", e)))?;
        Ok(outputs.drain(..).collect())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use ess_lib::ContentType;

    fn partial(content_id: i64, min_id: u64, max_id: u64) -> Content {
        Content {
            content_id,
            coll_id: 9,
            scope: "s".to_string(),
            name: "f1".to_string(),
            content_type: ContentType::Partial,
            min_id,
            max_id,
            pfn: Some(format!("/cache/f1#{}-{}", min_id, max_id)),
            ..Default::default()
        }
    }

    fn settings(command: &str, args: &[&str]) -> ProcessSplitterSettings {
        ProcessSplitterSettings {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stop_timeout_secs: 2,
            ..Default::default()
        }
    }

    async fn wait_outputs(splitter: &ProcessSplitter, count: usize) -> Vec<SplitOutput> {
        let mut outputs = Vec::new();
        for _ in 0..200 {
            if splitter.has_outputs() {
                outputs.extend(splitter.get_outputs().await.expect("outputs"));
            }
            if outputs.len() >= count {
                return outputs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} outputs, got {}", count, outputs.len());
    }

    #[tokio::test]
    async fn test_echo_child_round_trip() {
        // `cat` answers every request line with itself, which reads back as a location.
        let splitter = ProcessSplitter::new(settings("cat", &[])).expect("splitter");
        splitter.start().await.expect("start");
        assert!(splitter.need_more_requests());

        splitter
            .send_requests(&[partial(1, 1, 10), partial(2, 11, 20)])
            .await
            .expect("send");
        let mut outputs = wait_outputs(&splitter, 2).await;
        outputs.sort_by_key(|o| o.content_id);
        assert_eq!(outputs[0].pfn, "/cache/f1#1-10");
        assert_eq!(outputs[1].coll_id, 9);
        assert!(splitter.need_more_requests());

        splitter.stop().await.expect("stop");
        let err = splitter
            .send_requests(&[partial(3, 21, 23)])
            .await
            .expect_err("stopped");
        assert!(matches!(err, EssError::PluginExecution(_)));
    }

    #[tokio::test]
    async fn test_failed_ranges_are_resent_then_reported() {
        let _ = env_logger::builder().is_test(true).try_init();
        let script = r#"while read line; do echo '{"content_id": 7, "error": "bad range"}'; done"#;
        let mut config = settings("sh", &["-c", script]);
        config.max_attempts = 2;
        let splitter = ProcessSplitter::new(config).expect("splitter");
        splitter.start().await.expect("start");

        splitter.send_requests(&[partial(7, 1, 10)]).await.expect("send");
        let outputs = wait_outputs(&splitter, 1).await;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].content_id, 7);
        assert!(outputs[0].is_failure());
        assert!(outputs[0]
            .error
            .as_deref()
            .map(|e| e.contains("bad range"))
            .unwrap_or(false));
        assert_eq!(splitter.shared.in_flight_len(), 0);
        assert!(splitter.is_running());
        splitter.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_exited_child_fails_unanswered_ranges() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = settings("sh", &["-c", "read line; exit 0"]);
        config.max_pending = 1;
        let splitter = ProcessSplitter::new(config).expect("splitter");
        splitter.start().await.expect("start");

        splitter.send_requests(&[partial(4, 1, 10)]).await.expect("send");
        assert!(!splitter.need_more_requests());
        let outputs = wait_outputs(&splitter, 1).await;
        assert_eq!(outputs[0].content_id, 4);
        assert!(outputs[0].is_failure());

        for _ in 0..200 {
            if !splitter.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!splitter.is_running());
        assert_eq!(splitter.shared.in_flight_len(), 0);
        assert!(!splitter.need_more_requests());
        let err = splitter
            .send_requests(&[partial(5, 11, 20)])
            .await
            .expect_err("child gone");
        assert!(matches!(err, EssError::PluginExecution(_)));
        splitter.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_missing_command() {
        assert!(ProcessSplitter::new(ProcessSplitterSettings::default()).is_err());
        let splitter =
            ProcessSplitter::new(settings("/nonexistent/ess-splitter", &[])).expect("splitter");
        let err = splitter.start().await.expect_err("spawn");
        assert!(matches!(err, EssError::PluginExecution(_)));
    }
}
