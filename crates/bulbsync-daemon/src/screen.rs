//! Screen capture source and sampler.
//!
//! ffmpeg grabs the screen, scales each frame down to `size × size` and writes
//! raw rgb24 to stdout.  A reader task keeps only the latest frame in a
//! `watch` channel; the core samples it on its own timer.  When ffmpeg exits
//! (user stopped sharing, permission denied, crash) the reader sends the
//! caller's `ended` event so teardown follows the same path as an explicit
//! stop.  Dropping `ScreenCapture` aborts the reader, which kills ffmpeg.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bulbsync_proto::color::Rgb;
use bulbsync_proto::config::CaptureConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub(crate) type Frame = Option<Arc<Vec<u8>>>;

pub struct ScreenCapture {
    reader: AbortHandle,
    frames: watch::Receiver<Frame>,
}

impl ScreenCapture {
    /// Spawn ffmpeg.  Fails immediately if the binary cannot be started.
    pub fn start<E>(
        config: &CaptureConfig,
        size: u32,
        events: mpsc::Sender<E>,
        ended: E,
    ) -> anyhow::Result<Self>
    where
        E: Send + 'static,
    {
        let ffmpeg = bulbsync_proto::platform::find_ffmpeg_binary(config.ffmpeg_path.as_deref())
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let framerate = config.framerate.max(1).to_string();
        let scale = format!("scale={}:{}", size, size);

        info!(
            "ScreenCapture: starting {} -f {} -i {}",
            ffmpeg.display(),
            config.input_format,
            config.input
        );

        let mut child = Command::new(&ffmpeg)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-nostdin",
                "-f",
                &config.input_format,
                "-framerate",
                &framerate,
                "-i",
                &config.input,
                "-vf",
                &scale,
                "-pix_fmt",
                "rgb24",
                "-f",
                "rawvideo",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdout not captured"))?;

        let (frame_tx, frames) = watch::channel::<Frame>(None);
        let frame_len = (size as usize) * (size as usize) * 3;

        let task = tokio::spawn(async move {
            let count = read_frames(stdout, frame_len, &frame_tx).await;
            match child.wait().await {
                Ok(status) => info!("ScreenCapture: ffmpeg exited ({}) after {} frames", status, count),
                Err(e) => warn!("ScreenCapture: ffmpeg wait failed: {}", e),
            }
            let _ = events.send(ended).await;
        });

        Ok(Self {
            reader: task.abort_handle(),
            frames,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(reader: AbortHandle, frames: watch::Receiver<Frame>) -> Self {
        Self { reader, frames }
    }

    /// Average colour of the newest frame, `None` before the first frame.
    pub fn sample(&self) -> Option<Rgb> {
        let frame = self.frames.borrow().clone()?;
        average_color(&frame)
    }

    pub fn has_frame(&self) -> bool {
        self.frames.borrow().is_some()
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        debug!("ScreenCapture: stopping");
        self.reader.abort();
    }
}

/// Publish every complete `frame_len` chunk until EOF or a read error.
/// Returns the number of frames read.
pub async fn read_frames<R>(mut reader: R, frame_len: usize, tx: &watch::Sender<Frame>) -> u64
where
    R: AsyncRead + Unpin,
{
    if frame_len == 0 {
        return 0;
    }
    let mut count = 0;
    loop {
        let mut buf = vec![0u8; frame_len];
        match reader.read_exact(&mut buf).await {
            Ok(_) => {
                count += 1;
                let _ = tx.send(Some(Arc::new(buf)));
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!("ScreenCapture: read error: {}", e);
                }
                return count;
            }
        }
    }
}

/// Arithmetic mean of each channel over all rgb24 pixels.
pub fn average_color(frame: &[u8]) -> Option<Rgb> {
    let pixels = frame.len() / 3;
    if pixels == 0 {
        return None;
    }
    let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
    for px in frame.chunks_exact(3) {
        r += px[0] as u64;
        g += px[1] as u64;
        b += px[2] as u64;
    }
    let n = pixels as u64;
    Some(Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8))
}
