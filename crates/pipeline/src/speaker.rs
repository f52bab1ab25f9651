//! Outbound speaker task
//!
//! A single-writer queue per call: one utterance in flight at a time,
//! paced onto the carrier socket in 20 ms mu-law frames. The task checks
//! call liveness before starting TTS and again between the TTS request
//! completing and the first outbound frame, so an utterance raced by a
//! hangup is discarded silently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::{PipelineError, TtsClient};

/// 20 ms of 8 kHz mu-law
pub const OUTBOUND_FRAME_BYTES: usize = 160;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Mu-law byte for digital silence, used to pad the trailing frame
const MULAW_SILENCE: u8 = 0xFF;

/// Seam over the TTS client so the speaker loop is testable
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize_stream(
        &self,
        text: &str,
    ) -> Result<mpsc::Receiver<Result<Bytes, PipelineError>>, PipelineError>;
}

#[async_trait]
impl Synthesizer for TtsClient {
    async fn synthesize_stream(
        &self,
        text: &str,
    ) -> Result<mpsc::Receiver<Result<Bytes, PipelineError>>, PipelineError> {
        self.synthesize(text).await
    }
}

/// Liveness predicate checked around the TTS request
pub type ActiveCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Callback reporting synthesized audio seconds (for the cost ledger)
pub type SynthesizedCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Handle for queueing utterances and awaiting drain
#[derive(Clone)]
pub struct SpeakerHandle {
    utterance_tx: mpsc::Sender<String>,
    idle_rx: watch::Receiver<bool>,
}

impl SpeakerHandle {
    /// Queue an utterance; returns false if the speaker has shut down.
    pub fn speak(&self, text: impl Into<String>) -> bool {
        self.utterance_tx.try_send(text.into()).is_ok()
    }

    pub fn is_idle(&self) -> bool {
        *self.idle_rx.borrow()
    }

    /// Wait until the speaker reports idle, bounded by `timeout`.
    ///
    /// Used by the recorder at finalize so accepted utterances make it
    /// into the transcript before persistence.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut idle_rx = self.idle_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if *idle_rx.borrow() {
                return true;
            }
            match tokio::time::timeout_at(deadline, idle_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Speaker task gone: nothing further will be written
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}

/// The outbound speaker task
pub struct OutboundSpeaker;

impl OutboundSpeaker {
    /// Spawn the speaker loop for one call.
    ///
    /// Frames are written to `frame_tx`; the task exits when the handle is
    /// dropped, the frame sink closes, or `cancel` flips true.
    pub fn spawn(
        synthesizer: Arc<dyn Synthesizer>,
        frame_tx: mpsc::Sender<Vec<u8>>,
        is_call_active: ActiveCheck,
        on_synthesized: SynthesizedCallback,
        cancel: watch::Receiver<bool>,
    ) -> SpeakerHandle {
        let (utterance_tx, mut utterance_rx) = mpsc::channel::<String>(16);
        let (idle_tx, idle_rx) = watch::channel(true);

        let mut task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    next = utterance_rx.recv() => match next {
                        Some(text) => text,
                        None => break,
                    },
                    _ = task_cancel.changed() => {
                        if *task_cancel.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                if !is_call_active() {
                    tracing::debug!("Discarding utterance for inactive call");
                    continue;
                }

                let _ = idle_tx.send(false);
                match play_utterance(
                    synthesizer.as_ref(),
                    &text,
                    &frame_tx,
                    &is_call_active,
                    cancel.clone(),
                )
                .await
                {
                    Ok(bytes_sent) if bytes_sent > 0 => {
                        on_synthesized(TtsClient::mulaw_seconds(bytes_sent));
                    }
                    Ok(_) => {}
                    Err(PipelineError::Cancelled) => {
                        let _ = idle_tx.send(true);
                        break;
                    }
                    Err(PipelineError::MediaSocketClosed) => {
                        let _ = idle_tx.send(true);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Utterance failed: {}", e);
                    }
                }
                let _ = idle_tx.send(true);
            }
            tracing::debug!("Speaker task exiting");
        });

        SpeakerHandle {
            utterance_tx,
            idle_rx,
        }
    }
}

/// Stream one utterance onto the carrier socket in paced frames.
///
/// Returns the number of mu-law bytes written.
async fn play_utterance(
    synthesizer: &dyn Synthesizer,
    text: &str,
    frame_tx: &mpsc::Sender<Vec<u8>>,
    is_call_active: &ActiveCheck,
    mut cancel: watch::Receiver<bool>,
) -> Result<usize, PipelineError> {
    let mut chunks = synthesizer.synthesize_stream(text).await?;

    // Await the provider's first byte before committing to playback
    let mut pending: VecDeque<u8> = VecDeque::new();
    match chunks.recv().await {
        Some(Ok(bytes)) => pending.extend(bytes.iter()),
        Some(Err(e)) => return Err(e),
        None => return Ok(0),
    }

    // The call may have ended while TTS was running
    if !is_call_active() {
        tracing::debug!("Call ended during synthesis; discarding utterance");
        return Ok(0);
    }

    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stream_done = false;
    let mut sent = 0usize;

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Err(PipelineError::Cancelled);
                }
            }
            chunk = chunks.recv(), if !stream_done => {
                match chunk {
                    Some(Ok(bytes)) => pending.extend(bytes.iter()),
                    Some(Err(e)) => return Err(e),
                    None => stream_done = true,
                }
            }
            _ = ticker.tick() => {
                if pending.len() >= OUTBOUND_FRAME_BYTES {
                    let frame: Vec<u8> = pending.drain(..OUTBOUND_FRAME_BYTES).collect();
                    if frame_tx.send(frame).await.is_err() {
                        return Err(PipelineError::MediaSocketClosed);
                    }
                    sent += OUTBOUND_FRAME_BYTES;
                } else if stream_done {
                    if !pending.is_empty() {
                        let mut frame: Vec<u8> = pending.drain(..).collect();
                        frame.resize(OUTBOUND_FRAME_BYTES, MULAW_SILENCE);
                        if frame_tx.send(frame).await.is_err() {
                            return Err(PipelineError::MediaSocketClosed);
                        }
                        sent += OUTBOUND_FRAME_BYTES;
                    }
                    return Ok(sent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSynth {
        audio: Vec<u8>,
    }

    #[async_trait]
    impl Synthesizer for FakeSynth {
        async fn synthesize_stream(
            &self,
            _text: &str,
        ) -> Result<mpsc::Receiver<Result<Bytes, PipelineError>>, PipelineError> {
            let (tx, rx) = mpsc::channel(4);
            let audio = self.audio.clone();
            tokio::spawn(async move {
                for chunk in audio.chunks(400) {
                    if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterance_paced_into_frames() {
        let synth = Arc::new(FakeSynth {
            audio: vec![0u8; 800], // 100 ms
        });
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let seconds = Arc::new(AtomicUsize::new(0));
        let seconds_clone = seconds.clone();

        let handle = OutboundSpeaker::spawn(
            synth,
            frame_tx,
            Arc::new(|| true),
            Arc::new(move |s| {
                seconds_clone.store((s * 1000.0) as usize, Ordering::SeqCst);
            }),
            cancel_rx,
        );

        assert!(handle.speak("hello"));

        let mut frames = Vec::new();
        for _ in 0..5 {
            frames.push(frame_rx.recv().await.unwrap());
        }
        assert!(frames.iter().all(|f| f.len() == OUTBOUND_FRAME_BYTES));

        assert!(handle.wait_idle(Duration::from_secs(1)).await);
        // 800 bytes = 100 ms
        assert_eq!(seconds.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_call_discards_utterance() {
        let synth = Arc::new(FakeSynth {
            audio: vec![0u8; 800],
        });
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(false));
        let active_clone = active.clone();

        let handle = OutboundSpeaker::spawn(
            synth,
            frame_tx,
            Arc::new(move || active_clone.load(Ordering::SeqCst)),
            Arc::new(|_| {}),
            cancel_rx,
        );

        assert!(handle.speak("hello"));
        assert!(handle.wait_idle(Duration::from_secs(1)).await);
        // No frames were written for the dead call
        assert!(frame_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_playback() {
        let synth = Arc::new(FakeSynth {
            audio: vec![0u8; 80_000], // 10 s of audio
        });
        let (frame_tx, mut frame_rx) = mpsc::channel(4096);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = OutboundSpeaker::spawn(
            synth,
            frame_tx,
            Arc::new(|| true),
            Arc::new(|_| {}),
            cancel_rx,
        );

        assert!(handle.speak("long speech"));
        // Let a few frames through, then cancel
        for _ in 0..3 {
            frame_rx.recv().await.unwrap();
        }
        cancel_tx.send(true).unwrap();
        assert!(handle.wait_idle(Duration::from_secs(1)).await);

        // Drain whatever was in flight; the stream must end well short of
        // the full 500 frames
        let mut remaining = 0;
        while frame_rx.try_recv().is_ok() {
            remaining += 1;
        }
        assert!(remaining < 100);
    }
}
