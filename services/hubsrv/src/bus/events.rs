//! Router event decoding
//!
//! In Operate mode the router pushes frames on its own. Several events can
//! share one frame and one checksum; [`split_events`] walks the payload and
//! yields each event in order.

use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::commands::code;
use crate::protocol::serial::SerialFrame;

/// Module event identifiers
pub mod event_id {
    pub const FLG_CHG: u8 = 6;
    pub const LOGIC_CHG: u8 = 7;
    pub const OUT_ON: u8 = 10;
    pub const OUT_OFF: u8 = 11;
    pub const IRDA_SHORT: u8 = 23;
    pub const IRDA_LONG: u8 = 24;
    pub const IRDA_LONG_END: u8 = 25;
    pub const DIRECT_COMMAND: u8 = 68;
    pub const SYS_ERR: u8 = 101;
    pub const BTN_SHORT: u8 = 150;
    pub const BTN_LONG: u8 = 151;
    pub const SW_ON: u8 = 152;
    pub const SW_OFF: u8 = 153;
    pub const BTN_LONG_END: u8 = 154;
    pub const UNKNOWN_163: u8 = 163;
    pub const EKEY_FNGR: u8 = 169;
    pub const DIR_CMD: u8 = 253;
    pub const EVENTS_STARTED: u8 = 254;
    pub const EVENTS_STOPPED: u8 = 255;
}

/// Event kinds reported to the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum EventType {
    Button = 1,
    Switch = 2,
    Output = 3,
    Finger = 4,
    IrCmd = 5,
    Flag = 6,
    Counter = 7,
    DirCmd = 8,
    SysErr = 9,
}

impl EventType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// `(module, type, arg1, arg2)` tuple handed to the notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusEvent {
    pub module: u8,
    pub kind: EventType,
    pub arg1: u16,
    pub arg2: u16,
}

impl BusEvent {
    pub fn new(module: u8, kind: EventType, arg1: u16, arg2: u16) -> Self {
        Self {
            module,
            kind,
            arg1,
            arg2,
        }
    }

    /// Expand a multi-flag event into one event per flag
    ///
    /// Flag events with `arg1 > 999` carry a bit mask: `1000 + mask` for
    /// flags 1..8, `2000 + mask` for flags 9..16. `arg2` holds the new flag
    /// values under the same mask.
    pub fn expand(self) -> Vec<BusEvent> {
        if self.kind != EventType::Flag || self.arg1 <= 999 {
            return vec![self];
        }
        let mut mask = self.arg1 - 1000;
        let mut offset = 0;
        if mask > 999 {
            mask -= 1000;
            offset = 8;
        }
        (0..8u16)
            .filter(|bit| mask & (1 << bit) != 0)
            .map(|bit| {
                let value = u16::from(self.arg2 & (1 << bit) != 0);
                BusEvent::new(self.module, EventType::Flag, bit + offset + 1, value)
            })
            .collect()
    }
}

/// One decoded router event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    OperateStarted,
    /// Mirror and events stopped; last frame of an Operate session
    MirrorStopped,
    EventModeStarted,
    EventModeStopped,
    /// Router channel status block
    ChannelStatus(Vec<u8>),
    DirectCommand { module: u8, command: Vec<u8> },
    /// Reply of a remote hub for a forwarded command
    ForwardResponse(Vec<u8>),
    Module(BusEvent),
    /// Mirror block of one module, index 0 is the module id
    Mirror { module: u8, status: Vec<u8> },
    SystemMode(u8),
    /// System mode report while the router is in config mode
    ConfigMode,
    /// Recognised frame whose content is not used
    Ignored { code: u8, reason: &'static str },
}

const MIRROR_EVENT_LEN: usize = 227;
const CHANNEL_EVENT_LEN: usize = 43;
const CONFIG_MODE: u8 = 75;

/// Decode every event carried by `frame`
///
/// Mirror blocks with a bad checksum are dropped; other events are decoded
/// regardless, matching the router's tolerance for line noise.
pub fn split_events(frame: &SerialFrame) -> Vec<RouterEvent> {
    let mut payload = Vec::with_capacity(1 + frame.data.len());
    payload.push(frame.code);
    payload.extend_from_slice(&frame.data);

    let mut events = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let rest = &payload[pos..];
        let (event, used) = decode_one(rest, frame.checksum_ok);
        events.push(event);
        pos += used.max(1);
        if pos < payload.len() {
            debug!("Appended event message: {} bytes left", payload.len() - pos);
        }
    }
    events
}

/// Decode the event at the start of `p` (`code data..`), returning its size
fn decode_one(p: &[u8], checksum_ok: bool) -> (RouterEvent, usize) {
    let at = |i: usize| p.get(i).copied().unwrap_or(0);
    let all = p.len();

    match p[0] {
        code::MODE_ACK => {
            let event = if at(1) == 1 {
                RouterEvent::OperateStarted
            } else {
                RouterEvent::MirrorStopped
            };
            (event, 2.min(all))
        },
        code::CHANNEL_STATUS => {
            let used = CHANNEL_EVENT_LEN.min(all);
            if at(2) == 0 {
                return (
                    RouterEvent::Ignored {
                        code: p[0],
                        reason: "channel status with mode 0",
                    },
                    used,
                );
            }
            (RouterEvent::ChannelStatus(p[1..used].to_vec()), used)
        },
        code::DIRECT_COMMAND => {
            let used = (usize::from(at(4)) + 3).min(all);
            (
                RouterEvent::DirectCommand {
                    module: at(1),
                    command: p.get(2..used).unwrap_or(&[]).to_vec(),
                },
                used,
            )
        },
        code::FORWARD_RESPONSE => (RouterEvent::ForwardResponse(p.to_vec()), all),
        code::SYSTEM_EVENT => decode_system_event(p),
        code::MIRROR_STATUS => {
            let used = MIRROR_EVENT_LEN.min(all);
            if !checksum_ok {
                warn!("Invalid router message checksum, mirror discarded");
                return (
                    RouterEvent::Ignored {
                        code: p[0],
                        reason: "mirror with bad checksum",
                    },
                    used,
                );
            }
            (
                RouterEvent::Mirror {
                    module: at(1),
                    status: p[1..used].to_vec(),
                },
                used,
            )
        },
        code::SYSTEM_MODE => {
            let event = if all != 2 {
                warn!("Invalid system mode length: {} bytes", all);
                RouterEvent::Ignored {
                    code: p[0],
                    reason: "invalid system mode length",
                }
            } else if at(1) == CONFIG_MODE {
                RouterEvent::ConfigMode
            } else {
                RouterEvent::SystemMode(at(1))
            };
            (event, all)
        },
        other => {
            warn!("Router message discarded, code {}", other);
            (
                RouterEvent::Ignored {
                    code: other,
                    reason: "not an event",
                },
                all,
            )
        },
    }
}

fn decode_system_event(p: &[u8]) -> (RouterEvent, usize) {
    use event_id::*;

    let at = |i: usize| p.get(i).copied().unwrap_or(0);
    let all = p.len();
    let module = at(1);
    let id = at(2);

    if module == EVENTS_STARTED || module == EVENTS_STOPPED {
        let event = if module == EVENTS_STARTED {
            RouterEvent::EventModeStarted
        } else {
            RouterEvent::EventModeStopped
        };
        return (event, 3.min(all));
    }
    if id == UNKNOWN_163 || all == 2 {
        warn!("Unknown event command: {:?}", p.get(2..).unwrap_or(&[]));
        return (
            RouterEvent::Ignored {
                code: p[0],
                reason: "unknown event command",
            },
            2.min(all),
        );
    }

    let a0 = u16::from(at(3));
    let a1 = u16::from(at(4));
    let short = 4.min(all);
    let long = 5.min(all);
    debug!("Router event type {} from module {}", id, module);

    let (event, used) = match id {
        BTN_SHORT => (BusEvent::new(module, EventType::Button, a0, 1), short),
        BTN_LONG => (BusEvent::new(module, EventType::Button, a0, 2), short),
        BTN_LONG_END => (BusEvent::new(module, EventType::Button, a0, 3), short),
        SW_ON => (BusEvent::new(module, EventType::Switch, a0, 1), short),
        SW_OFF => (BusEvent::new(module, EventType::Switch, a0, 0), short),
        OUT_ON => (BusEvent::new(module, EventType::Output, a0, 1), short),
        OUT_OFF => (BusEvent::new(module, EventType::Output, a0, 0), short),
        EKEY_FNGR => (BusEvent::new(module, EventType::Finger, a0, a1), long),
        IRDA_SHORT => (BusEvent::new(module, EventType::IrCmd, a0, a1), long),
        FLG_CHG => (BusEvent::new(module, EventType::Flag, a0, a1), long),
        LOGIC_CHG => (BusEvent::new(module, EventType::Counter, a0, a1), long),
        DIR_CMD => (BusEvent::new(module, EventType::DirCmd, a0, 0), short),
        SYS_ERR => (BusEvent::new(0, EventType::SysErr, a0, a1), long),
        DIRECT_COMMAND => {
            warn!("Event 68: {:?}", p);
            return (
                RouterEvent::Ignored {
                    code: p[0],
                    reason: "direct command event",
                },
                (usize::from(at(4)) + 2).min(all),
            );
        },
        other => {
            warn!("Unknown event id: {}", other);
            return (
                RouterEvent::Ignored {
                    code: p[0],
                    reason: "unknown event id",
                },
                short,
            );
        },
    };
    (RouterEvent::Module(event), used)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::serial::{decode_serial_frame, encode_serial_response};

    fn frame(code: u8, data: &[u8]) -> SerialFrame {
        let wire = encode_serial_response(1, code, data);
        decode_serial_frame(&wire[1..]).unwrap()
    }

    #[test]
    fn test_mode_ack_events() {
        assert_eq!(
            split_events(&frame(code::MODE_ACK, &[1])),
            vec![RouterEvent::OperateStarted]
        );
        assert_eq!(
            split_events(&frame(code::MODE_ACK, &[0])),
            vec![RouterEvent::MirrorStopped]
        );
    }

    #[test]
    fn test_button_event_tuple() {
        let events = split_events(&frame(code::SYSTEM_EVENT, &[12, event_id::BTN_LONG, 3]));
        assert_eq!(
            events,
            vec![RouterEvent::Module(BusEvent::new(12, EventType::Button, 3, 2))]
        );
    }

    #[test]
    fn test_sys_err_reports_module_zero() {
        let events = split_events(&frame(code::SYSTEM_EVENT, &[9, event_id::SYS_ERR, 4, 7]));
        assert_eq!(
            events,
            vec![RouterEvent::Module(BusEvent::new(0, EventType::SysErr, 4, 7))]
        );
    }

    #[test]
    fn test_appended_events_split_in_order() {
        // Output on, then flag change, then event mode stopped, one checksum
        let data = [
            5,
            event_id::OUT_ON,
            2,
            code::SYSTEM_EVENT,
            5,
            event_id::FLG_CHG,
            3,
            1,
            code::SYSTEM_EVENT,
            event_id::EVENTS_STOPPED,
            0,
        ];
        let events = split_events(&frame(code::SYSTEM_EVENT, &data));
        assert_eq!(
            events,
            vec![
                RouterEvent::Module(BusEvent::new(5, EventType::Output, 2, 1)),
                RouterEvent::Module(BusEvent::new(5, EventType::Flag, 3, 1)),
                RouterEvent::EventModeStopped,
            ]
        );
    }

    #[test]
    fn test_event_after_mode_ack() {
        let data = [1, code::SYSTEM_EVENT, event_id::EVENTS_STARTED, 0];
        assert_eq!(
            split_events(&frame(code::MODE_ACK, &data)),
            vec![RouterEvent::OperateStarted, RouterEvent::EventModeStarted]
        );
    }

    #[test]
    fn test_mirror_event_and_bad_checksum() {
        let mut status = vec![0u8; 226];
        status[0] = 17;
        let good = frame(code::MIRROR_STATUS, &status);
        assert_eq!(
            split_events(&good),
            vec![RouterEvent::Mirror {
                module: 17,
                status: status.clone()
            }]
        );

        let mut wire = encode_serial_response(1, code::MIRROR_STATUS, &status);
        let last = wire.len() - 1;
        wire[last] ^= 1;
        let bad = decode_serial_frame(&wire[1..]).unwrap();
        assert!(matches!(
            split_events(&bad)[0],
            RouterEvent::Ignored { .. }
        ));
    }

    #[test]
    fn test_channel_status_mode_zero_discarded() {
        let mut data = vec![0u8; 42];
        data[1] = 0;
        assert!(matches!(
            split_events(&frame(code::CHANNEL_STATUS, &data))[0],
            RouterEvent::Ignored { .. }
        ));
        data[1] = 3;
        assert_eq!(
            split_events(&frame(code::CHANNEL_STATUS, &data)),
            vec![RouterEvent::ChannelStatus(data.clone())]
        );
    }

    #[test]
    fn test_system_mode() {
        assert_eq!(
            split_events(&frame(code::SYSTEM_MODE, &[0x20])),
            vec![RouterEvent::SystemMode(0x20)]
        );
        assert_eq!(
            split_events(&frame(code::SYSTEM_MODE, &[CONFIG_MODE])),
            vec![RouterEvent::ConfigMode]
        );
    }

    #[test]
    fn test_unknown_event_id_skipped() {
        let data = [3, 99, 1, code::SYSTEM_EVENT, 3, event_id::SW_ON, 4];
        let events = split_events(&frame(code::SYSTEM_EVENT, &data));
        assert!(matches!(events[0], RouterEvent::Ignored { .. }));
        assert_eq!(
            events[1],
            RouterEvent::Module(BusEvent::new(3, EventType::Switch, 4, 1))
        );
    }

    #[test]
    fn test_multi_flag_expansion() {
        // Flags 1 and 3 changed, flag 1 now set
        let low = BusEvent::new(4, EventType::Flag, 1000 + 0b101, 0b001).expand();
        assert_eq!(
            low,
            vec![
                BusEvent::new(4, EventType::Flag, 1, 1),
                BusEvent::new(4, EventType::Flag, 3, 0),
            ]
        );

        let high = BusEvent::new(4, EventType::Flag, 2000 + 0b10, 0b10).expand();
        assert_eq!(high, vec![BusEvent::new(4, EventType::Flag, 10, 1)]);

        let single = BusEvent::new(4, EventType::Flag, 7, 1);
        assert_eq!(single.expand(), vec![single]);
    }
}
