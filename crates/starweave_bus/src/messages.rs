//! The bus message set.
//!
//! Each message type has a stable numeric tag and a fixed payload layout.
//! Frames are `[len: u32][tag: u16][payload]`, little-endian, where `len`
//! counts the tag and payload bytes. Paths travel as an `i32` quadrant count
//! followed by the packed 2-bit bytes.

use std::net::{IpAddr, SocketAddr};

use starweave_spatial::geom::Vec2;
use starweave_spatial::{NodePath, Quad};

use crate::error::BusError;
use crate::ship::Spaceship;
use crate::wire::{WireError, WireReader, WireWriter};

pub const TAG_NODE_CONFIG: u16 = 0x0001;
pub const TAG_STRUCK: u16 = 0x0002;
pub const TAG_SHIP_CONNECTED: u16 = 0x0003;
pub const TAG_SHIP_DISCONNECTED: u16 = 0x0004;
pub const TAG_SHIP_TRANSFERRED: u16 = 0x0005;
pub const TAG_TRANSFER_SHIP: u16 = 0x0006;
pub const TAG_NODE_OFFLINE: u16 = 0x0007;
pub const TAG_SCAN_SHOOT: u16 = 0x0010;

/// A compute node announcing (or the arbiter re-announcing) its place in
/// the partition tree.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub bounds: Quad,
    pub path: NodePath,
    /// Where the node's bus listens, packed as length-prefixed bytes
    /// (ip octets then the port) on the wire.
    pub bus_addr: SocketAddr,
    pub api_url: String,
}

/// A node has left the tree; peers drop their routing entries for it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOffline {
    pub path: NodePath,
    pub api_url: String,
}

/// Arbiter -> node: take ownership of a newly connected ship.
/// Node -> arbiter: acknowledgment that the ship now exists locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ShipConnected {
    pub token: String,
}

/// Mirror of [`ShipConnected`] for disconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ShipDisconnected {
    pub token: String,
}

/// Arbiter -> node: a ship moved into this node's region, with its state.
#[derive(Debug, Clone, PartialEq)]
pub struct ShipTransferred {
    pub ship: Spaceship,
}

/// Node -> arbiter: this ship drifted out of my bounds; re-home it at
/// `path` (the best-fit node the sender knows about).
#[derive(Debug, Clone, PartialEq)]
pub struct TransferShip {
    pub ship: Spaceship,
    pub path: NodePath,
}

/// A cone-shaped spatial query, optionally carrying shot energy.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanShoot {
    pub originator: String,
    pub origin: Vec2,
    pub direction: f64,
    /// Half-width of the cone, radians.
    pub width: f64,
    pub radius: f64,
    /// `energy * scaling` for a shot; zero for a plain scan.
    pub scaled_energy: f64,
}

/// One struck (or scanned) ship. A negative `area_gain` marks a fatal hit;
/// the originator credits its absolute value.
#[derive(Debug, Clone, PartialEq)]
pub struct StruckShip {
    pub ship: Spaceship,
    pub area_gain: f64,
}

/// Reply to a [`ScanShoot`]: every ship the responding node saw in the cone.
#[derive(Debug, Clone, PartialEq)]
pub struct Struck {
    pub originator: String,
    pub ships_info: Vec<StruckShip>,
}

/// Any decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    NodeConfig(NodeConfig),
    NodeOffline(NodeOffline),
    ShipConnected(ShipConnected),
    ShipDisconnected(ShipDisconnected),
    ShipTransferred(ShipTransferred),
    TransferShip(TransferShip),
    ScanShoot(ScanShoot),
    Struck(Struck),
}

fn put_path(w: &mut WireWriter, path: &NodePath) {
    w.put_i32(path.len() as i32);
    w.put_raw(&path.to_bytes());
}

fn get_path(r: &mut WireReader<'_>) -> Result<NodePath, WireError> {
    let len = r.i32()?;
    if !(0..=starweave_spatial::MAX_DEPTH as i32).contains(&len) {
        return Err(WireError::InvalidValue("path length out of range"));
    }
    let len = len as usize;
    let bytes = r.raw(NodePath::byte_len(len))?;
    NodePath::from_bytes(len, bytes).map_err(|_| WireError::InvalidValue("packed path"))
}

fn put_addr(w: &mut WireWriter, addr: SocketAddr) {
    let mut bytes = match addr.ip() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    bytes.extend_from_slice(&addr.port().to_le_bytes());
    w.put_bytes(&bytes);
}

fn get_addr(r: &mut WireReader<'_>) -> Result<SocketAddr, WireError> {
    let bytes = r.bytes()?;
    let (ip, port): (IpAddr, _) = match bytes.len() {
        6 => {
            let mut o = [0u8; 4];
            o.copy_from_slice(&bytes[..4]);
            (o.into(), [bytes[4], bytes[5]])
        }
        18 => {
            let mut o = [0u8; 16];
            o.copy_from_slice(&bytes[..16]);
            (o.into(), [bytes[16], bytes[17]])
        }
        _ => return Err(WireError::InvalidValue("bus address must be 6 or 18 bytes")),
    };
    Ok(SocketAddr::new(ip, u16::from_le_bytes(port)))
}

impl Message {
    pub fn tag(&self) -> u16 {
        match self {
            Message::NodeConfig(_) => TAG_NODE_CONFIG,
            Message::NodeOffline(_) => TAG_NODE_OFFLINE,
            Message::ShipConnected(_) => TAG_SHIP_CONNECTED,
            Message::ShipDisconnected(_) => TAG_SHIP_DISCONNECTED,
            Message::ShipTransferred(_) => TAG_SHIP_TRANSFERRED,
            Message::TransferShip(_) => TAG_TRANSFER_SHIP,
            Message::ScanShoot(_) => TAG_SCAN_SHOOT,
            Message::Struck(_) => TAG_STRUCK,
        }
    }

    fn encode_payload(&self, w: &mut WireWriter) {
        match self {
            Message::NodeConfig(m) => {
                w.put_f64(m.bounds.center_x);
                w.put_f64(m.bounds.center_y);
                w.put_f64(m.bounds.half_extent);
                put_path(w, &m.path);
                put_addr(w, m.bus_addr);
                w.put_str(&m.api_url);
            }
            Message::NodeOffline(m) => {
                put_path(w, &m.path);
                w.put_str(&m.api_url);
            }
            Message::ShipConnected(m) => w.put_str(&m.token),
            Message::ShipDisconnected(m) => w.put_str(&m.token),
            Message::ShipTransferred(m) => m.ship.encode(w),
            Message::TransferShip(m) => {
                m.ship.encode(w);
                put_path(w, &m.path);
            }
            Message::ScanShoot(m) => {
                w.put_str(&m.originator);
                w.put_f64(m.origin.x);
                w.put_f64(m.origin.y);
                w.put_f64(m.direction);
                w.put_f64(m.width);
                w.put_f64(m.radius);
                w.put_f64(m.scaled_energy);
            }
            Message::Struck(m) => {
                w.put_str(&m.originator);
                w.put_i32(m.ships_info.len() as i32);
                for info in &m.ships_info {
                    info.ship.encode(w);
                    w.put_f64(info.area_gain);
                }
            }
        }
    }

    fn decode_payload(tag: u16, r: &mut WireReader<'_>) -> Result<Message, WireError> {
        Ok(match tag {
            TAG_NODE_CONFIG => Message::NodeConfig(NodeConfig {
                bounds: Quad::new(r.f64()?, r.f64()?, r.f64()?),
                path: get_path(r)?,
                bus_addr: get_addr(r)?,
                api_url: r.str()?,
            }),
            TAG_NODE_OFFLINE => Message::NodeOffline(NodeOffline {
                path: get_path(r)?,
                api_url: r.str()?,
            }),
            TAG_SHIP_CONNECTED => Message::ShipConnected(ShipConnected { token: r.str()? }),
            TAG_SHIP_DISCONNECTED => {
                Message::ShipDisconnected(ShipDisconnected { token: r.str()? })
            }
            TAG_SHIP_TRANSFERRED => Message::ShipTransferred(ShipTransferred {
                ship: Spaceship::decode(r)?,
            }),
            TAG_TRANSFER_SHIP => Message::TransferShip(TransferShip {
                ship: Spaceship::decode(r)?,
                path: get_path(r)?,
            }),
            TAG_SCAN_SHOOT => Message::ScanShoot(ScanShoot {
                originator: r.str()?,
                origin: Vec2::new(r.f64()?, r.f64()?),
                direction: r.f64()?,
                width: r.f64()?,
                radius: r.f64()?,
                scaled_energy: r.f64()?,
            }),
            TAG_STRUCK => {
                let originator = r.str()?;
                let count = r.i32()?;
                if count < 0 {
                    return Err(WireError::InvalidValue("negative struck count"));
                }
                let mut ships_info = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    ships_info.push(StruckShip {
                        ship: Spaceship::decode(r)?,
                        area_gain: r.f64()?,
                    });
                }
                Message::Struck(Struck {
                    originator,
                    ships_info,
                })
            }
            _ => return Err(WireError::InvalidValue("unknown message tag")),
        })
    }

    /// Encodes the full frame: `[len][tag][payload]`.
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut payload = WireWriter::new();
        self.encode_payload(&mut payload);
        let payload = payload.into_bytes();

        let mut w = WireWriter::new();
        w.put_u32((payload.len() + 2) as u32);
        w.put_u16(self.tag());
        w.put_raw(&payload);
        w.into_bytes()
    }

    /// Decodes one frame; the reader is left positioned after it.
    pub fn decode_frame(r: &mut WireReader<'_>) -> Result<Message, BusError> {
        let len = r.u32().map_err(BusError::Wire)? as usize;
        if len < 2 {
            return Err(BusError::Malformed {
                tag: 0,
                reason: format!("frame length {len} too short"),
            });
        }
        let frame = r.raw(len).map_err(BusError::Wire)?;
        let mut fr = WireReader::new(frame);
        let tag = fr.u16().map_err(BusError::Wire)?;
        Message::decode_payload(tag, &mut fr).map_err(|e| BusError::Malformed {
            tag,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starweave_spatial::Quadrant;

    fn round_trip(msg: Message) -> Message {
        let frame = msg.encode_frame();
        let back = Message::decode_frame(&mut WireReader::new(&frame)).unwrap();
        assert_eq!(back, msg);
        back
    }

    #[test]
    fn node_config_round_trips_with_path() {
        let path = NodePath::from_quadrants(vec![Quadrant::Se, Quadrant::Nw]).unwrap();
        round_trip(Message::NodeConfig(NodeConfig {
            bounds: Quad::new(512.0, -512.0, 512.0),
            path,
            bus_addr: "10.1.2.3:3000".parse().unwrap(),
            api_url: "http://10.1.2.3:8000".into(),
        }));
        round_trip(Message::NodeConfig(NodeConfig {
            bounds: Quad::universe(1024.0),
            path: NodePath::root(),
            bus_addr: "[2001:db8::7]:3000".parse().unwrap(),
            api_url: "http://[2001:db8::7]:8000".into(),
        }));
    }

    #[test]
    fn node_config_packs_the_port_into_the_address_bytes() {
        let msg = Message::NodeConfig(NodeConfig {
            bounds: Quad::new(0.0, 0.0, 1.0),
            path: NodePath::root(),
            bus_addr: "10.1.2.3:3000".parse().unwrap(),
            api_url: String::new(),
        });
        let frame = msg.encode_frame();
        // After len, tag, three f64s and the empty path (i32 zero), the
        // address is one length-prefixed field: 4 ip octets plus 2 port
        // bytes, little-endian.
        let addr_field = &frame[4 + 2 + 24 + 4..];
        assert_eq!(addr_field[..4], 6u32.to_le_bytes());
        assert_eq!(addr_field[4..8], [10, 1, 2, 3]);
        assert_eq!(addr_field[8..10], 3000u16.to_le_bytes());
    }

    #[test]
    fn scan_shoot_and_struck_round_trip() {
        round_trip(Message::ScanShoot(ScanShoot {
            originator: "abc-123".into(),
            origin: Vec2::new(10.0, -20.0),
            direction: 1.5,
            width: 0.25,
            radius: 300.0,
            scaled_energy: 16000.0,
        }));

        let mut victim = Spaceship::new("victim-token-123");
        victim.area = 2.0;
        round_trip(Message::Struck(Struck {
            originator: "abc-123".into(),
            ships_info: vec![
                StruckShip {
                    ship: victim.clone(),
                    area_gain: 0.0,
                },
                StruckShip {
                    ship: victim,
                    area_gain: -2.5,
                },
            ],
        }));
    }

    #[test]
    fn unknown_tag_is_malformed_not_fatal() {
        let mut w = WireWriter::new();
        w.put_u32(2);
        w.put_u16(0xBEEF);
        let bytes = w.into_bytes();
        let err = Message::decode_frame(&mut WireReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, BusError::Malformed { tag: 0xBEEF, .. }));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let msg = Message::ShipConnected(ShipConnected {
            token: "abcdefgh".into(),
        });
        let mut frame = msg.encode_frame();
        frame.truncate(frame.len() - 3);
        assert!(Message::decode_frame(&mut WireReader::new(&frame)).is_err());
    }

    #[test]
    fn transfer_ship_carries_best_fit_path() {
        let path = NodePath::from_quadrants(vec![Quadrant::Ne]).unwrap();
        let msg = round_trip(Message::TransferShip(TransferShip {
            ship: Spaceship::new("wandering-ship-1"),
            path: path.clone(),
        }));
        match msg {
            Message::TransferShip(m) => assert_eq!(m.path, path),
            _ => unreachable!(),
        }
    }
}
