//! SETTINGS parameters: the tunables exchanged at connection start and any
//! time either side wants to update them (spec.md section 4.4.5).

use enum_map::{enum_map, Enum, EnumMap};
use log::trace;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::error::ConnectionError;
use crate::hpack::HpackContexts;
use crate::scheduler::Scheduler;
use crate::types::StreamId;

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

/// RFC 7540 section 6.5.2's initial values, kept as a `const` `EnumMap` the
/// way `Atte-http2::connection.rs` seeds `their_settings`.
pub const DEFAULTS: EnumMap<SettingsParameter, u32> = enum_map! {
    SettingsParameter::HeaderTableSize => 4_096,
    SettingsParameter::EnablePush => 1,
    SettingsParameter::MaxConcurrentStreams => u32::MAX,
    SettingsParameter::InitialWindowSize => 65_535,
    SettingsParameter::MaxFrameSize => 16_384,
    SettingsParameter::MaxHeaderListSize => u32::MAX,
};

/// One endpoint's view of the negotiated settings: what we've told the peer
/// (`local`) and what the peer has told us (`remote`), plus the count of
/// SETTINGS frames we've sent that haven't been ACKed yet.
#[derive(Debug, Clone)]
pub struct Settings {
    pub local: EnumMap<SettingsParameter, u32>,
    pub remote: EnumMap<SettingsParameter, u32>,
    pub unacked_sent: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local: DEFAULTS,
            remote: DEFAULTS,
            unacked_sent: 0,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn remote_max_frame_size(&self) -> u32 {
        self.remote[SettingsParameter::MaxFrameSize]
    }

    #[must_use]
    pub fn remote_initial_window_size(&self) -> u32 {
        self.remote[SettingsParameter::InitialWindowSize]
    }

    #[must_use]
    pub fn remote_enable_push(&self) -> bool {
        self.remote[SettingsParameter::EnablePush] != 0
    }

    #[must_use]
    pub fn remote_max_concurrent_streams(&self) -> u32 {
        self.remote[SettingsParameter::MaxConcurrentStreams]
    }

    /// Validate a whole incoming (non-ACK) SETTINGS payload before applying
    /// any entry, per spec.md section 4.4.5: "reject illegal values at
    /// parse time; a whole-list validation error surfaces as a connection
    /// error".
    pub fn validate(params: &[(SettingsParameter, u32)]) -> Result<(), ConnectionError> {
        for &(param, value) in params {
            match param {
                SettingsParameter::EnablePush if value > 1 => {
                    return Err(ConnectionError::protocol_error(
                        "SETTINGS_ENABLE_PUSH must be 0 or 1",
                    ));
                }
                SettingsParameter::InitialWindowSize
                    if value > crate::types::U31_MAX.get() =>
                {
                    return Err(ConnectionError::flow_control_error(
                        "SETTINGS_INITIAL_WINDOW_SIZE exceeds 2^31-1",
                    ));
                }
                SettingsParameter::MaxFrameSize if !(16_384..=16_777_215).contains(&value) => {
                    return Err(ConnectionError::protocol_error(
                        "SETTINGS_MAX_FRAME_SIZE out of the allowed [2^14, 2^24-1] range",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Apply a validated incoming SETTINGS payload in order (spec.md section
    /// 4.4.5), mutating every live stream's flow window when the initial
    /// window size changes.
    pub fn apply(
        &mut self,
        params: &[(SettingsParameter, u32)],
        scheduler: &mut Scheduler,
        hpack: &mut HpackContexts,
        current_max_frame_size: &mut dyn FnMut(StreamId, u32),
    ) -> Result<(), ConnectionError> {
        for &(param, value) in params {
            match param {
                SettingsParameter::HeaderTableSize => {
                    trace!("settings: header table size -> {value}");
                    hpack.set_encoder_table_size(value as usize);
                }
                SettingsParameter::EnablePush => {
                    trace!("settings: enable push -> {value}");
                }
                SettingsParameter::MaxConcurrentStreams => {
                    trace!("settings: max concurrent streams -> {value}");
                }
                SettingsParameter::InitialWindowSize => {
                    let old = self.remote[SettingsParameter::InitialWindowSize];
                    let delta = i64::from(value) - i64::from(old);
                    trace!("settings: initial window size {old} -> {value} (delta {delta})");
                    if !scheduler.add_flow_to_all(delta) {
                        return Err(ConnectionError::flow_control_error(
                            "SETTINGS_INITIAL_WINDOW_SIZE delta overflowed a stream window",
                        ));
                    }
                }
                SettingsParameter::MaxFrameSize => {
                    trace!("settings: max frame size -> {value}");
                    for id in scheduler.open_stream_ids_requiring_output() {
                        current_max_frame_size(id, value);
                    }
                }
                SettingsParameter::MaxHeaderListSize => {
                    trace!("settings: max header list size -> {value}");
                }
            }
            self.remote[param] = value;
        }
        Ok(())
    }
}
