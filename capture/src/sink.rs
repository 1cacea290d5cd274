//! Frame sink – owns the external transcoder process.
//!
//! Raw YUV420p frames go into the transcoder's stdin; MPEG1 comes out of
//! its stdout and is handed to the broadcast relay.  Writes block when the
//! transcoder falls behind, which throttles capture to transcoding speed.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, TryLockError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use plantcam_common::config::Config;

use crate::error::PipelineError;

/// How often `flush` re-checks the child while waiting for it to exit.
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Program and arguments used to launch the transcoder.
#[derive(Debug, Clone)]
pub struct TranscoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TranscoderCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// rawvideo/yuv420p on stdin → mpeg1video on stdout, sized from `config`.
    pub fn mpeg1(config: &Config) -> Self {
        let size = format!("{}x{}", config.width, config.height);
        let rate = config.framerate.to_string();
        Self::new(
            config.transcoder.clone(),
            &[
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "yuv420p",
                "-s",
                &size,
                "-r",
                &rate,
                "-i",
                "-",
                "-f",
                "mpeg1video",
                "-b:v",
                &config.transcoder_bitrate,
                "-r",
                &rate,
                "-",
            ],
        )
    }
}

/// Destination for raw frames produced by the camera.
pub trait FrameOutput: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<(), PipelineError>;
}

/// Writes frames into the transcoder and supervises its shutdown.
pub struct FrameSink {
    program: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    grace: Duration,
}

impl FrameSink {
    /// Spawn the transcoder. Returns the sink and the transcoder's stdout.
    pub fn spawn(
        cmd: &TranscoderCommand,
        grace: Duration,
    ) -> Result<(Self, ChildStdout), PipelineError> {
        info!("Spawning transcoder: {} {}", cmd.program, cmd.args.join(" "));
        let spawn_err = |source| PipelineError::TranscoderSpawn {
            program: cmd.program.clone(),
            source,
        };

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_err(std::io::Error::other("transcoder pipes unavailable")));
        };

        // Drain stderr so a chatty transcoder never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let name = cmd.program.clone();
            std::thread::Builder::new()
                .name("transcoder-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(l) if l.is_empty() => {}
                            Ok(l) => warn!("[{name}] {l}"),
                            Err(_) => break,
                        }
                    }
                    debug!("{name} stderr stream ended");
                })
                .ok();
        }

        info!("Transcoder started (pid={})", child.id());
        Ok((
            Self {
                program: cmd.program.clone(),
                stdin: Mutex::new(Some(stdin)),
                child: Mutex::new(child),
                grace,
            },
            stdout,
        ))
    }

    /// Forward bytes to the transcoder, blocking while its input is full.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PipelineError> {
        let mut guard = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        let stdin = guard.as_mut().ok_or(PipelineError::SinkClosed)?;
        stdin.write_all(bytes)?;
        Ok(())
    }

    /// Whether the transcoder process has terminated.
    pub fn has_exited(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        !matches!(child.try_wait(), Ok(None))
    }

    /// Close the transcoder input and wait for it to exit.
    ///
    /// If it is still alive after the grace period it is killed and
    /// `TranscoderTimeout` is returned.  A writer blocked on a stalled
    /// transcoder holds the input lock; the kill releases it.
    pub fn flush(&self) -> Result<(), PipelineError> {
        info!("Waiting for {} to exit", self.program);
        let deadline = Instant::now() + self.grace;

        let closed = loop {
            match self.stdin.try_lock() {
                Ok(mut guard) => {
                    drop(guard.take());
                    break true;
                }
                Err(TryLockError::Poisoned(e)) => {
                    drop(e.into_inner().take());
                    break true;
                }
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => break false,
                Err(TryLockError::WouldBlock) => std::thread::sleep(EXIT_POLL),
            }
        };
        if !closed {
            warn!("Transcoder input is still busy, cannot close it");
        }

        {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(status) = child.try_wait()? {
                    if status.success() {
                        info!("{} exited cleanly", self.program);
                    } else {
                        warn!("{} exited with {status}", self.program);
                    }
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(EXIT_POLL);
            }

            warn!("{} still running after {:?}, killing it", self.program, self.grace);
            if let Err(e) = child.kill() {
                warn!("Cannot kill {}: {e}", self.program);
            }
            let _ = child.wait();
        }

        if !closed {
            self.stdin.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
        Err(PipelineError::TranscoderTimeout(self.grace))
    }
}

impl FrameOutput for FrameSink {
    fn write_frame(&self, frame: &[u8]) -> Result<(), PipelineError> {
        self.write(frame)
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Ok(None) = child.try_wait() {
            warn!("Transcoder dropped while running, killing pid {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_mpeg1_arguments_follow_config() {
        let mut config = Config::default();
        config.width = 320;
        config.height = 240;
        config.framerate = 15;
        let cmd = TranscoderCommand::mpeg1(&config);
        assert_eq!(cmd.program, "ffmpeg");
        let args = cmd.args.join(" ");
        assert!(args.contains("-pix_fmt yuv420p -s 320x240 -r 15 -i -"));
        assert!(args.contains("-f mpeg1video -b:v 800k -r 15 -"));
    }

    #[test]
    fn test_passthrough_preserves_bytes_and_exits_cleanly() {
        let cmd = TranscoderCommand::new("cat", &[]);
        let (sink, mut stdout) = FrameSink::spawn(&cmd, Duration::from_secs(5)).unwrap();

        sink.write(b"frame-1;").unwrap();
        sink.write_frame(b"frame-2;").unwrap();
        sink.flush().unwrap();
        assert!(sink.has_exited());

        let mut out = String::new();
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "frame-1;frame-2;");
    }

    #[test]
    fn test_write_after_flush_is_rejected() {
        let cmd = TranscoderCommand::new("cat", &[]);
        let (sink, _stdout) = FrameSink::spawn(&cmd, Duration::from_secs(5)).unwrap();
        sink.flush().unwrap();
        assert!(matches!(sink.write(b"late"), Err(PipelineError::SinkClosed)));
    }

    #[test]
    fn test_stubborn_transcoder_is_killed_after_grace() {
        let cmd = TranscoderCommand::new("sleep", &["30"]);
        let (sink, _stdout) = FrameSink::spawn(&cmd, Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        let err = sink.flush().unwrap_err();
        assert!(matches!(err, PipelineError::TranscoderTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sink.has_exited());
    }

    #[test]
    fn test_blocked_writer_is_released_by_kill() {
        let cmd = TranscoderCommand::new("sleep", &["30"]);
        let (sink, _stdout) = FrameSink::spawn(&cmd, Duration::from_millis(300)).unwrap();
        let sink = std::sync::Arc::new(sink);

        // Nobody reads `sleep`'s stdin, so this fills the pipe and blocks.
        let writer = {
            let sink = sink.clone();
            std::thread::spawn(move || {
                let chunk = vec![0u8; 64 * 1024];
                loop {
                    if sink.write(&chunk).is_err() {
                        break;
                    }
                }
            })
        };
        std::thread::sleep(Duration::from_millis(100));

        assert!(sink.flush().is_err());
        writer.join().unwrap();
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let cmd = TranscoderCommand::new("/nonexistent/transcoder", &[]);
        let err = FrameSink::spawn(&cmd, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, PipelineError::TranscoderSpawn { .. }));
    }
}
