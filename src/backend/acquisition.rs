//! Acquisition loop
//!
//! The [`AcquisitionWorker`] owns the read side of the scope link. Each cycle:
//!
//! 1. send `S G`
//! 2. wait for a ready frame (`'A'` + end address)
//! 3. send `S B`
//! 4. wait for a dump frame (`'D'` + 4096 bytes)
//! 5. decode with the calibration in effect at that moment
//! 6. publish the sample to the fan-out registry
//!
//! Commands are written through [`CaptureConfig`] so they never interleave
//! with a setting change made from the control panel thread.
//!
//! A read timeout is not an error. The worker keeps waiting for the frame it
//! expects, and gives the cycle up when stop was requested or after
//! `max_consecutive_timeouts` empty reads in a row. Bytes that do not start the
//! expected frame, and ready frames whose end address is not a record slot, go
//! to the [`ViolationPolicy`].
//!
//! A dump that arrives after its cycle was given up is dropped as a whole at
//! the start of the next cycle instead of being resynchronized byte by byte.

use crate::backend::codec::{
    check_dump_tag, parse_ready, ScopeCommand, DUMP_PAYLOAD_LEN, DUMP_TAG, READY_FRAME_LEN,
    READY_TAG,
};
use crate::backend::decoder::decode_sample;
use crate::backend::link::FrameReader;
use crate::backend::policy::{ViolationAction, ViolationPolicy};
use crate::config::CaptureConfig;
use crate::error::{ProtocolError, Result, ScopeError};
use crate::fanout::FanoutRegistry;
use crate::types::{Record, Sample};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Counters reported when the acquisition loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Samples decoded and published
    pub captures: u64,
    /// Bytes skipped to get back in step with the scope
    pub resyncs: u64,
    /// Reads that returned no data in time
    pub timeouts: u64,
    /// Cycles given up before a sample was produced
    pub abandoned_cycles: u64,
    /// Bytes of late dumps from abandoned cycles that were dropped
    pub stale_bytes: u64,
}

/// Tag plus payload of a dump frame
const DUMP_FRAME_LEN: usize = 1 + DUMP_PAYLOAD_LEN;

/// Blocking loop that captures, decodes and publishes samples
pub struct AcquisitionWorker<R> {
    frames: FrameReader<R>,
    capture: Arc<CaptureConfig>,
    registry: Arc<FanoutRegistry>,
    policy: Box<dyn ViolationPolicy>,
    running: Arc<AtomicBool>,
    max_consecutive_timeouts: u32,
    /// A dump was requested but never read
    dump_outstanding: bool,
    stats: AcquisitionStats,
}

impl<R: Read> AcquisitionWorker<R> {
    pub fn new(
        reader: R,
        capture: Arc<CaptureConfig>,
        registry: Arc<FanoutRegistry>,
        policy: Box<dyn ViolationPolicy>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            frames: FrameReader::new(reader),
            capture,
            registry,
            policy,
            running,
            max_consecutive_timeouts: 0,
            dump_outstanding: false,
            stats: AcquisitionStats::default(),
        }
    }

    /// Give up a cycle after this many empty reads in a row; 0 waits forever
    pub fn with_timeout_limit(mut self, max_consecutive_timeouts: u32) -> Self {
        self.max_consecutive_timeouts = max_consecutive_timeouts;
        self
    }

    pub fn stats(&self) -> &AcquisitionStats {
        &self.stats
    }

    /// Run cycles until the running flag is cleared
    ///
    /// The flag is checked between cycles and while waiting out a timeout,
    /// never in the middle of a command write.
    pub fn run(mut self) -> Result<AcquisitionStats> {
        tracing::info!("Acquisition loop started");

        while self.running.load(Ordering::SeqCst) {
            match self.run_cycle() {
                Ok(Some(sample)) => {
                    let report = self.registry.publish(&Record::from(sample))?;
                    tracing::trace!(
                        "Published capture {} to {} subscribers",
                        self.stats.captures,
                        report.delivered
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Acquisition loop failed: {}", e);
                    return Err(e);
                }
            }
        }

        tracing::info!("Acquisition loop stopped ({:?})", self.stats);
        Ok(self.stats)
    }

    /// One capture; `None` when the cycle was abandoned
    pub fn run_cycle(&mut self) -> Result<Option<Sample>> {
        self.capture.send(ScopeCommand::BeginCapture)?;
        let ready = |frame: &[u8]| parse_ready(frame).map(|_| ());
        let Some(frame) = self.await_frame(READY_TAG, READY_FRAME_LEN, ready)? else {
            self.abandon_cycle();
            return Ok(None);
        };
        let end_address = parse_ready(&frame)?;
        self.dump_outstanding = false;
        tracing::trace!("Scope ready, end address {}", end_address);

        self.capture.send(ScopeCommand::RequestDump)?;
        let Some(frame) = self.await_frame(DUMP_TAG, DUMP_FRAME_LEN, |_| Ok(()))? else {
            self.dump_outstanding = true;
            self.abandon_cycle();
            return Ok(None);
        };
        check_dump_tag(frame[0])?;

        let state = self.capture.snapshot()?;
        let sample = decode_sample(&frame[1..], end_address, &state, self.capture.calibration())?;
        self.stats.captures += 1;
        Ok(Some(sample))
    }

    /// Forget a partial frame, keeping the head of a dump that may still arrive
    fn abandon_cycle(&mut self) {
        self.stats.abandoned_cycles += 1;
        if !(self.dump_outstanding && self.frames.buffered().first() == Some(&DUMP_TAG)) {
            self.frames.clear();
        }
    }

    /// Wait for a `len`-byte frame starting with `tag` that passes `validate`
    fn await_frame(
        &mut self,
        tag: u8,
        len: usize,
        validate: impl Fn(&[u8]) -> std::result::Result<(), ProtocolError>,
    ) -> Result<Option<Vec<u8>>> {
        let mut timeouts = 0u32;
        let mut skipped = 0u64;
        loop {
            let head = self.frames.buffered().first().copied();
            let wanted = if self.dump_outstanding && tag != DUMP_TAG && head == Some(DUMP_TAG) {
                DUMP_FRAME_LEN
            } else if head == Some(tag) {
                len
            } else {
                1
            };
            if !self.frames.fill(wanted)? {
                self.stats.timeouts += 1;
                timeouts += 1;
                if !self.running.load(Ordering::SeqCst) {
                    tracing::debug!("Stop requested while waiting for '{}' frame", tag as char);
                    return Ok(None);
                }
                if self.max_consecutive_timeouts > 0 && timeouts >= self.max_consecutive_timeouts {
                    tracing::warn!(
                        "No '{}' frame after {} timeouts, abandoning cycle",
                        tag as char,
                        timeouts
                    );
                    return Ok(None);
                }
                continue;
            }
            timeouts = 0;

            let buffered = self.frames.buffered();
            if self.dump_outstanding && tag != DUMP_TAG && buffered[0] == DUMP_TAG {
                if buffered.len() >= DUMP_FRAME_LEN {
                    self.frames.discard(DUMP_FRAME_LEN);
                    self.dump_outstanding = false;
                    self.stats.stale_bytes += DUMP_FRAME_LEN as u64;
                    tracing::debug!("Dropped late dump from an abandoned cycle");
                }
                continue;
            }

            let violation = if buffered[0] == tag {
                if buffered.len() < len {
                    continue;
                }
                match validate(&buffered[..len]) {
                    Ok(()) => {
                        if skipped > 0 {
                            tracing::warn!(
                                "Skipped {} bytes before '{}' frame",
                                skipped,
                                tag as char
                            );
                        }
                        self.policy.reset();
                        return Ok(Some(self.frames.take(len)));
                    }
                    Err(violation) => violation,
                }
            } else {
                ProtocolError::new(tag, buffered[..buffered.len().min(len)].to_vec())
            };

            match self.policy.on_violation(&violation) {
                ViolationAction::Resync => {
                    if skipped == 0 {
                        tracing::warn!("Resynchronizing: {}", violation);
                    } else {
                        tracing::trace!("Resynchronizing: {}", violation);
                    }
                    self.frames.discard(1);
                    skipped += 1;
                    self.stats.resyncs += 1;
                }
                ViolationAction::Abort => return Err(ScopeError::Protocol(violation)),
            }
        }
    }
}
