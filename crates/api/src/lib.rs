// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! api: Defines the wire contract for the Orchard machine-state stream.
//!
//! Every server-to-client frame is a JSON envelope `{uuid, type, body}` where
//! `type` selects one of the machine-event or machine-snapshot bodies below.
//! The stream is server-push only: clients never send payloads, so there is
//! no request/response vocabulary here.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

// --- Identifiers ---

/// Identifier of a managed guest machine.
///
/// Stable string form is the canonical hyphenated UUID; the JSON encoding is
/// that string, both as a value and as a map key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export)]
pub struct MachineId(#[ts(type = "string")] pub Uuid);

/// Identifier of a user account (administrator or client).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export)]
pub struct UserId(#[ts(type = "string")] pub Uuid);

macro_rules! id_impls {
    ($name:ident) => {
        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl From<Uuid> for $name {
            fn from(raw: Uuid) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }
    };
}

id_impls!(MachineId);
id_impls!(UserId);

impl Default for MachineId {
    fn default() -> Self {
        Self(Uuid::nil())
    }
}

// --- Payload building blocks ---

/// On-disk image format of a machine disk.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

/// Remote-access protocol exposed by a machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionProtocol {
    Ssh,
    Rdp,
    Vnc,
}

/// A user account reference embedded in machine properties.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct AccountRef {
    pub uuid: UserId,
    pub username: String,
}

/// Disk description as defined at machine creation time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct StaticDiskInfo {
    /// True for the boot disk, false for additionally attached disks.
    pub system: bool,
    pub name: String,
    pub size_bytes: u64,
    pub format: DiskFormat,
}

/// Disk description enriched with current usage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct DynamicDiskInfo {
    pub system: bool,
    pub name: String,
    pub size_bytes: u64,
    pub format: DiskFormat,
    pub occupied_bytes: u64,
}

/// An active remote-access session on a machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct ActiveConnection {
    pub protocol: ConnectionProtocol,
    pub username: Option<String>,
    /// RFC 3339 timestamp of when the connection was established.
    #[serde(with = "time::serde::rfc3339::option")]
    #[ts(type = "string | null")]
    pub connected_since: Option<time::OffsetDateTime>,
}

// --- Payloads ---

/// Static machine data: changes only through explicit modification.
#[derive(Serialize, Deserialize, Debug, Clone, Default, TS)]
#[ts(export)]
pub struct MachinePropertiesPayload {
    pub uuid: MachineId,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub description: Option<String>,
    pub owner: Option<AccountRef>,
    #[serde(default)]
    #[ts(type = "Record<string, AccountRef>")]
    pub assigned_clients: HashMap<UserId, AccountRef>,
    /// Port of the machine's display (framebuffer) endpoint, when exposed.
    pub display_port: Option<u16>,
    #[ts(type = "Record<string, string> | null")]
    pub connections: Option<HashMap<ConnectionProtocol, String>>,
    pub disks: Option<Vec<StaticDiskInfo>>,
}

/// Frequently refreshed machine runtime state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct MachineStatePayload {
    pub uuid: MachineId,
    pub active: bool,
    pub loading: bool,
    pub vcpu: u32,
    /// Maximum memory in KiB, when known.
    pub ram_max: Option<u64>,
    /// Memory in use in KiB; zero while the machine is inactive.
    pub ram_used: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    #[ts(type = "string | null")]
    pub boot_timestamp: Option<time::OffsetDateTime>,
}

/// Infrequently refreshed disk usage snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct MachineDisksPayload {
    pub uuid: MachineId,
    pub disks: Option<Vec<DynamicDiskInfo>>,
}

/// Active remote-access connections of a machine.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, TS)]
#[ts(export)]
pub struct MachineConnectionsPayload {
    pub active_connections: Option<Vec<ActiveConnection>>,
}

/// Machine-keyed snapshot maps carried by the `DATA_*` bodies.
pub type PropertiesMap = HashMap<MachineId, MachinePropertiesPayload>;
pub type StatesMap = HashMap<MachineId, MachineStatePayload>;
pub type DisksMap = HashMap<MachineId, MachineDisksPayload>;
pub type ConnectionsMap = HashMap<MachineId, MachineConnectionsPayload>;

/// Body of the single-machine lifecycle messages.
///
/// `error` is always present on the wire; it is `null` for everything but
/// the `*_FAIL` messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[ts(export)]
pub struct MachineEventBody {
    pub uuid: MachineId,
    pub error: Option<String>,
}

impl MachineEventBody {
    pub fn ok(uuid: MachineId) -> Self {
        Self { uuid, error: None }
    }

    pub fn failed(uuid: MachineId, error: impl Into<String>) -> Self {
        Self { uuid, error: Some(error.into()) }
    }
}

// --- Messages ---

/// Tagged message body of a stream frame.
///
/// Lifecycle messages (`CREATE`, `DELETE`, `BOOTUP_*`, `SHUTDOWN_*` and the
/// modify-triggered `DATA_STATIC`) are dispatched when an administrative
/// action happens; the `DATA_*` snapshot messages are also produced by the
/// periodic broadcast loops.
#[derive(Serialize, Deserialize, Debug, Clone, TS)]
#[ts(export)]
#[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    /// A machine was created; carries the full static properties.
    Create(MachinePropertiesPayload),
    Delete(MachineEventBody),
    BootupStart(MachineEventBody),
    BootupSuccess(MachineEventBody),
    BootupFail(MachineEventBody),
    ShutdownStart(MachineEventBody),
    ShutdownSuccess(MachineEventBody),
    ShutdownFail(MachineEventBody),
    /// Static properties per machine.
    DataStatic(#[ts(type = "Record<string, MachinePropertiesPayload>")] PropertiesMap),
    /// Runtime state per machine.
    DataDynamic(#[ts(type = "Record<string, MachineStatePayload>")] StatesMap),
    /// Disk usage per machine.
    DataDynamicDisks(#[ts(type = "Record<string, MachineDisksPayload>")] DisksMap),
    /// Active connections per machine.
    DataDynamicConnections(#[ts(type = "Record<string, MachineConnectionsPayload>")] ConnectionsMap),
}

impl MessageBody {
    /// The wire tag of this body, for logging and metrics labels.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Create(_) => "CREATE",
            Self::Delete(_) => "DELETE",
            Self::BootupStart(_) => "BOOTUP_START",
            Self::BootupSuccess(_) => "BOOTUP_SUCCESS",
            Self::BootupFail(_) => "BOOTUP_FAIL",
            Self::ShutdownStart(_) => "SHUTDOWN_START",
            Self::ShutdownSuccess(_) => "SHUTDOWN_SUCCESS",
            Self::ShutdownFail(_) => "SHUTDOWN_FAIL",
            Self::DataStatic(_) => "DATA_STATIC",
            Self::DataDynamic(_) => "DATA_DYNAMIC",
            Self::DataDynamicDisks(_) => "DATA_DYNAMIC_DISKS",
            Self::DataDynamicConnections(_) => "DATA_DYNAMIC_CONNECTIONS",
        }
    }
}

/// Wire envelope for one stream frame.
///
/// # Example
/// ```json
/// {
///   "uuid": "6a1f0a52-0d6e-4d9f-bb1b-0f6c9f0e2d11",
///   "type": "BOOTUP_START",
///   "body": { "uuid": "00000000-0000-0000-0000-000000000001", "error": null }
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    /// Message identifier, freshly generated for every envelope.
    pub uuid: Uuid,
    #[serde(flatten)]
    pub message: MessageBody,
}

impl Envelope {
    /// Wraps a body in an envelope with a fresh message uuid.
    pub fn new(message: MessageBody) -> Self {
        Self { uuid: Uuid::new_v4(), message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(n: u128) -> MachineId {
        MachineId(Uuid::from_u128(n))
    }

    #[test]
    fn envelope_has_uuid_type_and_body_keys() {
        let envelope = Envelope::new(MessageBody::Delete(MachineEventBody::ok(mid(1))));
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();

        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 3);
        assert!(object.contains_key("uuid"));
        assert_eq!(object["type"], "DELETE");
        assert_eq!(object["body"]["uuid"], "00000000-0000-0000-0000-000000000001");
        // error must be materialized as null, not omitted
        assert!(object["body"].as_object().unwrap().contains_key("error"));
        assert_eq!(object["body"]["error"], serde_json::Value::Null);
    }

    #[test]
    fn envelope_uuid_is_fresh_per_instance() {
        let a = Envelope::new(MessageBody::Delete(MachineEventBody::ok(mid(1))));
        let b = Envelope::new(MessageBody::Delete(MachineEventBody::ok(mid(1))));
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn fail_body_carries_error_string() {
        let envelope = Envelope::new(MessageBody::BootupFail(MachineEventBody::failed(
            mid(2),
            "machine failed to start",
        )));
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "BOOTUP_FAIL");
        assert_eq!(value["body"]["error"], "machine failed to start");
    }

    #[test]
    fn snapshot_bodies_are_keyed_by_machine_uuid_string() {
        let mut map = StatesMap::new();
        map.insert(
            mid(3),
            MachineStatePayload {
                uuid: mid(3),
                active: true,
                loading: false,
                vcpu: 2,
                ram_max: Some(4_194_304),
                ram_used: Some(1_048_576),
                boot_timestamp: None,
            },
        );

        let value = serde_json::to_value(Envelope::new(MessageBody::DataDynamic(map))).unwrap();
        assert_eq!(value["type"], "DATA_DYNAMIC");
        let body = value["body"].as_object().unwrap();
        assert!(body.contains_key("00000000-0000-0000-0000-000000000003"));
        assert_eq!(body["00000000-0000-0000-0000-000000000003"]["vcpu"], 2);
    }

    #[test]
    fn all_tags_match_wire_names() {
        let b = MachineEventBody::ok(mid(9));
        let cases = [
            MessageBody::Create(MachinePropertiesPayload::default()),
            MessageBody::Delete(b.clone()),
            MessageBody::BootupStart(b.clone()),
            MessageBody::BootupSuccess(b.clone()),
            MessageBody::BootupFail(b.clone()),
            MessageBody::ShutdownStart(b.clone()),
            MessageBody::ShutdownSuccess(b.clone()),
            MessageBody::ShutdownFail(b),
            MessageBody::DataStatic(PropertiesMap::new()),
            MessageBody::DataDynamic(StatesMap::new()),
            MessageBody::DataDynamicDisks(DisksMap::new()),
            MessageBody::DataDynamicConnections(ConnectionsMap::new()),
        ];

        for case in cases {
            let expected = case.tag();
            let value = serde_json::to_value(&case).unwrap();
            assert_eq!(value["type"], expected);
        }
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::new(MessageBody::DataStatic(PropertiesMap::new()));
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.uuid, envelope.uuid);
        assert_eq!(back.message.tag(), "DATA_STATIC");
    }

    #[test]
    fn ids_parse_from_canonical_string_form() {
        let parsed: MachineId = "00000000-0000-0000-0000-000000000001".parse().unwrap();
        assert_eq!(parsed, mid(1));
        assert_eq!(parsed.to_string(), "00000000-0000-0000-0000-000000000001");
    }
}
