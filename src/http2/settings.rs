//! SETTINGS parameters (RFC 7540 Section 6.5).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use super::error::{ErrorCode, H2Error};
use crate::config::Http2Config;

pub const HEADER_TABLE_SIZE: u16 = 0x1;
pub const ENABLE_PUSH: u16 = 0x2;
pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const MAX_FRAME_SIZE: u16 = 0x5;
pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;
pub const MIN_FRAME_SIZE: u32 = 16_384;
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;

/// One side's settings. `None` means "unlimited" for the optional limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: MIN_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// The settings this server advertises.
    pub fn local(config: &Http2Config) -> Self {
        Self {
            header_table_size: config.header_table_size,
            enable_push: false,
            max_concurrent_streams: Some(config.max_concurrent_streams),
            initial_window_size: config.initial_window_size,
            max_frame_size: config.max_frame_size,
            max_header_list_size: Some(config.max_header_list_size),
        }
    }

    /// Values to put in our SETTINGS frame.
    pub fn to_values(&self) -> Vec<(u16, u32)> {
        let mut values = vec![
            (HEADER_TABLE_SIZE, self.header_table_size),
            (INITIAL_WINDOW_SIZE, self.initial_window_size),
            (MAX_FRAME_SIZE, self.max_frame_size),
        ];
        if let Some(max) = self.max_concurrent_streams {
            values.push((MAX_CONCURRENT_STREAMS, max));
        }
        if let Some(max) = self.max_header_list_size {
            values.push((MAX_HEADER_LIST_SIZE, max));
        }
        values
    }

    /// Applies a SETTINGS frame on top of the current values.
    ///
    /// Every value is validated before anything changes, so a rejected frame
    /// leaves the settings untouched. Unknown identifiers are ignored.
    pub fn merged(&self, values: &[(u16, u32)]) -> Result<Settings, H2Error> {
        let mut next = *self;
        for &(id, value) in values {
            match id {
                HEADER_TABLE_SIZE => next.header_table_size = value,
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(H2Error::connection(ErrorCode::ProtocolError, "ENABLE_PUSH must be 0 or 1"));
                    }
                    next.enable_push = value == 1;
                }
                MAX_CONCURRENT_STREAMS => next.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::connection(
                            ErrorCode::FlowControlError,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    next.initial_window_size = value;
                }
                MAX_FRAME_SIZE => {
                    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                        return Err(H2Error::connection(ErrorCode::ProtocolError, "MAX_FRAME_SIZE out of range"));
                    }
                    next.max_frame_size = value;
                }
                MAX_HEADER_LIST_SIZE => next.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(next)
    }

    /// Parses the `HTTP2-Settings` header of an h2c upgrade request
    /// (base64url SETTINGS payload, RFC 7540 Section 3.2.1).
    pub fn from_upgrade_header(value: &str) -> Result<Settings, H2Error> {
        let raw = URL_SAFE_NO_PAD
            .decode(value.trim().trim_end_matches('='))
            .map_err(|_| H2Error::connection(ErrorCode::ProtocolError, "invalid HTTP2-Settings encoding"))?;
        if raw.len() % 6 != 0 {
            return Err(H2Error::connection(ErrorCode::FrameSizeError, "HTTP2-Settings length"));
        }
        let values: Vec<(u16, u32)> = raw
            .chunks_exact(6)
            .map(|c| (u16::from_be_bytes([c[0], c[1]]), u32::from_be_bytes([c[2], c[3], c[4], c[5]])))
            .collect();
        Settings::default().merged(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_frame_leaves_settings_unchanged() {
        let current = Settings::default();
        let err = current
            .merged(&[(MAX_CONCURRENT_STREAMS, 10), (ENABLE_PUSH, 2)])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
        assert_eq!(current.max_concurrent_streams, None);
    }

    #[test]
    fn validates_ranges() {
        let s = Settings::default();
        assert_eq!(
            s.merged(&[(INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE + 1)]).unwrap_err().code(),
            ErrorCode::FlowControlError
        );
        assert!(s.merged(&[(MAX_FRAME_SIZE, MIN_FRAME_SIZE - 1)]).is_err());
        assert!(s.merged(&[(MAX_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT + 1)]).is_err());
        assert_eq!(s.merged(&[(0xff, 7)]).unwrap(), s);
    }

    #[test]
    fn partial_update_keeps_other_values() {
        let s = Settings::default()
            .merged(&[(MAX_CONCURRENT_STREAMS, 5)])
            .unwrap()
            .merged(&[(ENABLE_PUSH, 0)])
            .unwrap();
        assert_eq!(s.max_concurrent_streams, Some(5));
        assert!(!s.enable_push);
    }

    #[test]
    fn upgrade_header_decodes() {
        // MAX_CONCURRENT_STREAMS=100, INITIAL_WINDOW_SIZE=65535
        let s = Settings::from_upgrade_header("AAMAAABkAAQAAP__").unwrap();
        assert_eq!(s.max_concurrent_streams, Some(100));
        assert_eq!(s.initial_window_size, 65_535);
        assert!(Settings::from_upgrade_header("!!").is_err());
    }
}
