//! Chat notifications: post a still with a comment.
//!
//! Notifications are queued to a dedicated `notify` thread so a slow chat
//! API never holds up the capture loop.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use plantcam_common::config::Config;

const SLACK_UPLOAD_URL: &str = "https://slack.com/api/files.upload";
const QUEUE_DEPTH: usize = 16;

/// Delivers one image with a message to the chat channel.
pub trait Notifier: Send {
    fn notify(&self, image: &Path, message: &str) -> Result<()>;
}

/// Uploads the image to a Slack channel with the message as its comment.
pub struct SlackNotifier {
    client: reqwest::blocking::Client,
    token: String,
    channel: String,
}

impl SlackNotifier {
    pub fn new(token: &str, channel: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self {
            client,
            token: token.to_string(),
            channel: channel.to_string(),
        })
    }
}

impl Notifier for SlackNotifier {
    fn notify(&self, image: &Path, message: &str) -> Result<()> {
        let title = image
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let form = reqwest::blocking::multipart::Form::new()
            .text("channels", self.channel.clone())
            .text("initial_comment", message.to_string())
            .text("title", title.clone())
            .text("filename", title)
            .file("file", image)
            .with_context(|| format!("Cannot attach {}", image.display()))?;

        let resp = self
            .client
            .post(SLACK_UPLOAD_URL)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .context("POST files.upload")?;

        let body: serde_json::Value = resp.json().context("Parse files.upload response")?;
        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let msg = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            bail!("Slack upload failed: {msg}");
        }
        Ok(())
    }
}

/// Used when no chat credentials are configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, image: &Path, message: &str) -> Result<()> {
        info!("Notification: {message} ({})", image.display());
        Ok(())
    }
}

/// Pick the notifier the configuration asks for.
pub fn from_config(config: &Config) -> Result<Box<dyn Notifier>> {
    match (&config.slack_token, &config.slack_channel) {
        (Some(token), Some(channel)) => {
            info!("Notifications go to Slack channel {channel}");
            Ok(Box::new(SlackNotifier::new(token, channel)?))
        }
        _ => {
            warn!("SLACK_TOKEN/SLACK_CHANNEL not set – notifications are only logged");
            Ok(Box::new(LogNotifier))
        }
    }
}

/// One queued notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub image: PathBuf,
    pub message: String,
}

/// Cloneable producer side of the notification queue.
#[derive(Clone)]
pub struct NotifyHandle {
    tx: SyncSender<Notification>,
}

impl NotifyHandle {
    /// Fire and forget. A full queue drops the notification.
    pub fn send(&self, image: &Path, message: &str) {
        let item = Notification {
            image: image.to_path_buf(),
            message: message.to_string(),
        };
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!("Notification queue full, dropping: {}", n.message)
            }
            Err(TrySendError::Disconnected(n)) => {
                warn!("Notification thread is gone, dropping: {}", n.message)
            }
        }
    }
}

/// Owns the `notify` thread.
pub struct NotifyQueue {
    handle: NotifyHandle,
    thread: JoinHandle<()>,
}

impl NotifyQueue {
    pub fn start(notifier: Box<dyn Notifier>) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Notification>(QUEUE_DEPTH);
        let thread = std::thread::Builder::new()
            .name("notify".into())
            .spawn(move || handle_queue(rx, notifier.as_ref()))
            .context("Cannot spawn notify thread")?;
        Ok(Self {
            handle: NotifyHandle { tx },
            thread,
        })
    }

    pub fn handle(&self) -> NotifyHandle {
        self.handle.clone()
    }

    /// Deliver what is queued, then stop the thread. Handles still held
    /// elsewhere keep it alive until they are dropped.
    pub fn shutdown(self) {
        drop(self.handle);
        if self.thread.join().is_err() {
            error!("Notify thread panicked");
        }
    }
}

fn handle_queue(rx: Receiver<Notification>, notifier: &dyn Notifier) {
    while let Ok(item) = rx.recv() {
        match notifier.notify(&item.image, &item.message) {
            Ok(()) => info!("Notified: {}", item.message),
            Err(e) => error!("Notification failed: {e:#}"),
        }
    }
    info!("Notify thread finished");
}
