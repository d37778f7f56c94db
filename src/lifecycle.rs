use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::avcc::{FALLBACK_CODEC, fallback_decoder_config};
use crate::bitstream::NalUnit;
use crate::contract::{
    CodecState, DecoderConfig, DecoderFactory, StreamError, VideoDecoder,
};
use crate::dispatcher::AccessUnitDispatcher;
use crate::pipeline::FrameSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Unconfigured,
    Configuring,
    AwaitingKeyframe { deadline: Instant },
    Streaming,
    Closed,
}

impl fmt::Display for DecoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => f.write_str("unconfigured"),
            Self::Configuring => f.write_str("configuring"),
            Self::AwaitingKeyframe { .. } => f.write_str("awaiting-keyframe"),
            Self::Streaming => f.write_str("streaming"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotConfigured,
    AwaitingKeyframe,
    /// The decoder failed on this unit and was rebuilt.
    DecoderRebuilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Dispatched { timestamp_us: u64, is_key: bool },
    /// A keyframe that arrived while the decoder was still configuring. It is
    /// submitted as soon as the decoder reports configured.
    Held,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub frame_interval_us: u64,
    pub keyframe_timeout: Duration,
    pub rebuild_budget: u32,
}

/// Owns the one live decoder and decides what reaches it.
pub struct DecoderLifecycle {
    factory: Box<dyn DecoderFactory>,
    output: FrameSender,
    decoder: Option<Box<dyn VideoDecoder>>,
    /// Configuration asked for by the stream; re-applied on every rebuild.
    requested: Option<DecoderConfig>,
    /// Configuration the live decoder actually accepted.
    active: Option<DecoderConfig>,
    state: DecoderState,
    pending_keyframe: Option<NalUnit>,
    dispatcher: AccessUnitDispatcher,
    settings: LifecycleSettings,
    dispatched: u64,
    keyframes_dispatched: u64,
    consecutive_rebuilds: u32,
    total_rebuilds: u64,
    output_mark: u64,
}

impl DecoderLifecycle {
    pub fn new(
        factory: Box<dyn DecoderFactory>,
        output: FrameSender,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            factory,
            output,
            decoder: None,
            requested: None,
            active: None,
            state: DecoderState::Unconfigured,
            pending_keyframe: None,
            dispatcher: AccessUnitDispatcher::new(settings.frame_interval_us),
            settings,
            dispatched: 0,
            keyframes_dispatched: 0,
            consecutive_rebuilds: 0,
            total_rebuilds: 0,
            output_mark: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == DecoderState::Closed
    }

    pub fn requested_config(&self) -> Option<&DecoderConfig> {
        self.requested.as_ref()
    }

    pub fn active_config(&self) -> Option<&DecoderConfig> {
        self.active.as_ref()
    }

    pub fn rebuilds(&self) -> u64 {
        self.total_rebuilds
    }

    /// Units accepted by a decoder over the lifecycle's lifetime, rebuilds
    /// included.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn keyframes_dispatched(&self) -> u64 {
        self.keyframes_dispatched
    }

    /// Applies a configuration derived from the stream. Returns `Ok(false)`
    /// when the same configuration is already in place.
    pub fn apply_config(&mut self, config: DecoderConfig) -> Result<bool, StreamError> {
        if self.is_closed() {
            return Err(StreamError::SessionClosed);
        }
        if self.requested.as_ref() == Some(&config) && self.state != DecoderState::Unconfigured {
            debug!("parameter sets unchanged, keeping {config}");
            return Ok(false);
        }

        self.close_decoder();
        self.dispatcher.reset();
        self.pending_keyframe = None;
        self.requested = Some(config.clone());
        self.configure_fresh(&config)?;
        Ok(true)
    }

    /// Reads the decoder's state and advances the machine accordingly. Only
    /// fails when a rebuild it triggers exhausts the budget or cannot be
    /// configured.
    pub fn poll(&mut self, now: Instant) -> Result<(), StreamError> {
        let codec_state = match (&self.decoder, self.state) {
            (_, DecoderState::Unconfigured | DecoderState::Closed) => return Ok(()),
            (Some(decoder), _) => decoder.state(),
            (None, _) => CodecState::Closed,
        };

        match (self.state, codec_state) {
            (DecoderState::Configuring, CodecState::Configured) => {
                if let Some(keyframe) = self.pending_keyframe.take() {
                    info!("decoder configured, submitting the held keyframe");
                    self.state = DecoderState::Streaming;
                    return self.submit(&keyframe).map(|_| ());
                }
                let deadline = now + self.settings.keyframe_timeout;
                info!(
                    "decoder configured, waiting up to {:?} for a keyframe",
                    self.settings.keyframe_timeout
                );
                self.state = DecoderState::AwaitingKeyframe { deadline };
                Ok(())
            }
            (DecoderState::Configuring, CodecState::Unconfigured) => Ok(()),
            (_, CodecState::Configured) => Ok(()),
            (state, codec_state) => {
                self.rebuild(&format!("decoder reported {codec_state} while {state}"))
            }
        }
    }

    /// Gates one non-parameter-set unit and submits it when admitted.
    pub fn offer(&mut self, unit: &NalUnit, now: Instant) -> Result<UnitOutcome, StreamError> {
        if self.is_closed() {
            return Err(StreamError::SessionClosed);
        }
        self.poll(now)?;

        match self.state {
            DecoderState::Configuring if unit.is_keyframe_candidate() => {
                if self.pending_keyframe.replace(unit.clone()).is_some() {
                    debug!("newer keyframe replaces the one held during configuration");
                }
                Ok(UnitOutcome::Held)
            }
            DecoderState::Unconfigured | DecoderState::Configuring | DecoderState::Closed => {
                Ok(UnitOutcome::Dropped(DropReason::NotConfigured))
            }
            DecoderState::AwaitingKeyframe { deadline } => {
                if unit.is_keyframe_candidate() {
                    info!("keyframe received, streaming");
                } else if now >= deadline {
                    let timeout = StreamError::Timeout(format!(
                        "no keyframe within {:?}",
                        self.settings.keyframe_timeout
                    ));
                    warn!("{timeout}, starting on a delta unit");
                } else {
                    return Ok(UnitOutcome::Dropped(DropReason::AwaitingKeyframe));
                }
                self.state = DecoderState::Streaming;
                self.submit(unit)
            }
            DecoderState::Streaming => self.submit(unit),
        }
    }

    /// Idempotent. The lifecycle refuses all further work afterwards.
    pub fn teardown(&mut self) {
        if self.is_closed() {
            return;
        }
        self.close_decoder();
        self.dispatcher.reset();
        self.pending_keyframe = None;
        self.active = None;
        self.state = DecoderState::Closed;
        info!("decoder lifecycle closed");
    }

    fn submit(&mut self, unit: &NalUnit) -> Result<UnitOutcome, StreamError> {
        let access_unit = self.dispatcher.stamp(unit);
        let result = match self.decoder.as_mut() {
            Some(decoder) if decoder.state() == CodecState::Configured => {
                decoder.decode(&access_unit)
            }
            Some(decoder) => Err(StreamError::Decoder(format!(
                "decoder is {} at submission",
                decoder.state()
            ))),
            None => Err(StreamError::Decoder("no decoder at submission".to_string())),
        };

        match result {
            Ok(()) => {
                self.dispatched += 1;
                if access_unit.is_key {
                    self.keyframes_dispatched += 1;
                }
                Ok(UnitOutcome::Dispatched {
                    timestamp_us: access_unit.timestamp_us,
                    is_key: access_unit.is_key,
                })
            }
            Err(err) => {
                self.rebuild(&err.to_string())?;
                Ok(UnitOutcome::Dropped(DropReason::DecoderRebuilt))
            }
        }
    }

    fn rebuild(&mut self, reason: &str) -> Result<(), StreamError> {
        let produced = self.output.stats().decoded;
        if produced > self.output_mark {
            self.consecutive_rebuilds = 0;
        }
        self.output_mark = produced;
        self.consecutive_rebuilds += 1;
        self.total_rebuilds += 1;

        self.close_decoder();
        self.dispatcher.reset();
        self.pending_keyframe = None;
        self.active = None;
        self.state = DecoderState::Unconfigured;

        if self.consecutive_rebuilds > self.settings.rebuild_budget {
            error!(
                "decoder failed {} times without producing output, giving up: {reason}",
                self.consecutive_rebuilds
            );
            self.state = DecoderState::Closed;
            return Err(StreamError::DecoderFatal {
                attempts: self.consecutive_rebuilds,
                message: reason.to_string(),
            });
        }

        warn!(
            "rebuilding decoder ({}/{}): {reason}",
            self.consecutive_rebuilds, self.settings.rebuild_budget
        );
        match self.requested.clone() {
            Some(config) => self.configure_fresh(&config),
            None => Ok(()),
        }
    }

    /// Creates a decoder and configures it, retrying once with the Baseline
    /// fallback when a described configuration is rejected.
    fn configure_fresh(&mut self, config: &DecoderConfig) -> Result<(), StreamError> {
        let outcome = self.try_configure(config).or_else(|err| {
            if !config.has_description() {
                return Err(err);
            }
            warn!("decoder rejected {config}: {err}; retrying with {FALLBACK_CODEC}");
            let fallback = fallback_decoder_config((config.coded_width, config.coded_height));
            self.try_configure(&fallback)
        });

        match outcome {
            Ok(applied) => {
                info!("decoder configuring with {applied}");
                self.active = Some(applied);
                self.state = DecoderState::Configuring;
                Ok(())
            }
            Err(err) => {
                error!("decoder configuration failed: {err}");
                self.active = None;
                self.state = DecoderState::Unconfigured;
                Err(StreamError::Configuration(err.to_string()))
            }
        }
    }

    fn try_configure(&mut self, config: &DecoderConfig) -> Result<DecoderConfig, StreamError> {
        let mut decoder = self.factory.create(self.output.clone())?;
        match decoder.configure(config) {
            Ok(()) => {
                self.decoder = Some(decoder);
                Ok(config.clone())
            }
            Err(err) => {
                decoder.close();
                Err(err)
            }
        }
    }

    fn close_decoder(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
    }
}

impl fmt::Debug for DecoderLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderLifecycle")
            .field("state", &self.state)
            .field("requested", &self.requested)
            .field("active", &self.active)
            .field("pending_keyframe", &self.pending_keyframe.is_some())
            .field("total_rebuilds", &self.total_rebuilds)
            .finish_non_exhaustive()
    }
}
