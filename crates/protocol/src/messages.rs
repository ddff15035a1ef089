//! Control-plane message schemas
//!
//! Every JSON-RPC method and notification of the hub protocol has a typed
//! params struct here, plus a tagged enum per direction so dispatchers are
//! a single typed `match` instead of stringly-typed lookups.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorObject;
use crate::types::{ExportDesc, ImportSpec, Part, ReturnReason};

/// Params of `register_exporter`. Responds with the assigned place id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterExporter {
    pub place: ExportDesc,
}

/// Params of `reserve`. Responds with the reservation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reserve {
    pub spec: ImportSpec,
}

/// Params of `return_reservation`. Idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnReservation {
    pub reservation_id: u64,
}

/// Notification to the agent: its reservation was allocated.
///
/// `parts` maps each import part name to the place part it was assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceAvailable {
    pub reservation_id: u64,
    pub place_id: u64,
    pub host: String,
    pub port: u16,
    pub parts: BTreeMap<String, Part>,
    pub token: String,
}

/// Notification to the exporter: a peer may now open tunnels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceReserved {
    pub place_id: u64,
    pub peer_ip: IpAddr,
    pub token: String,
}

/// Notification to the exporter: the reservation on this place ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceReturned {
    pub place_id: u64,
}

/// Notification to the agent: its reservation was force-returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationLost {
    pub reservation_id: u64,
    pub reason: ReturnReason,
}

/// Requests a client may send to the hub.
#[derive(Debug)]
pub enum HubRequest {
    RegisterExporter(RegisterExporter),
    Reserve(Reserve),
    ReturnReservation(ReturnReservation),
}

impl HubRequest {
    pub const REGISTER_EXPORTER: &'static str = "register_exporter";
    pub const RESERVE: &'static str = "reserve";
    pub const RETURN_RESERVATION: &'static str = "return_reservation";

    /// Parse a method call into a typed request. Unknown methods map to a
    /// method-not-found error.
    pub fn parse(method: &str, params: Value) -> Result<Self, ErrorObject> {
        fn params_of<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ErrorObject> {
            serde_json::from_value(params).map_err(|e| ErrorObject::invalid_params(e.to_string()))
        }

        match method {
            Self::REGISTER_EXPORTER => Ok(Self::RegisterExporter(params_of(params)?)),
            Self::RESERVE => Ok(Self::Reserve(params_of(params)?)),
            Self::RETURN_RESERVATION => Ok(Self::ReturnReservation(params_of(params)?)),
            other => Err(ErrorObject::method_not_found(other)),
        }
    }
}

/// Notifications the hub pushes to its clients.
#[derive(Debug)]
pub enum HubNotification {
    PlaceAvailable(PlaceAvailable),
    PlaceReserved(PlaceReserved),
    PlaceReturned(PlaceReturned),
    ReservationLost(ReservationLost),
}

impl HubNotification {
    pub const PLACE_AVAILABLE: &'static str = "place_available";
    pub const PLACE_RESERVED: &'static str = "place_reserved";
    pub const PLACE_RETURNED: &'static str = "place_returned";
    pub const RESERVATION_LOST: &'static str = "reservation_lost";

    pub fn method(&self) -> &'static str {
        match self {
            Self::PlaceAvailable(_) => Self::PLACE_AVAILABLE,
            Self::PlaceReserved(_) => Self::PLACE_RESERVED,
            Self::PlaceReturned(_) => Self::PLACE_RETURNED,
            Self::ReservationLost(_) => Self::RESERVATION_LOST,
        }
    }

    pub fn params(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::PlaceAvailable(p) => serde_json::to_value(p),
            Self::PlaceReserved(p) => serde_json::to_value(p),
            Self::PlaceReturned(p) => serde_json::to_value(p),
            Self::ReservationLost(p) => serde_json::to_value(p),
        }
    }

    pub fn parse(method: &str, params: Value) -> Result<Self, ErrorObject> {
        fn params_of<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ErrorObject> {
            serde_json::from_value(params).map_err(|e| ErrorObject::invalid_params(e.to_string()))
        }

        match method {
            Self::PLACE_AVAILABLE => Ok(Self::PlaceAvailable(params_of(params)?)),
            Self::PLACE_RESERVED => Ok(Self::PlaceReserved(params_of(params)?)),
            Self::PLACE_RETURNED => Ok(Self::PlaceReturned(params_of(params)?)),
            Self::RESERVATION_LOST => Ok(Self::ReservationLost(params_of(params)?)),
            other => Err(ErrorObject::method_not_found(other)),
        }
    }
}
