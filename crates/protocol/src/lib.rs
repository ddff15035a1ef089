//! Protocol library for not-my-board
//!
//! Everything that crosses a wire lives here: the duplex JSON-RPC channel
//! used on the hub control plane and the agent's local IPC, the typed
//! control message schemas, the shared place/part data model, and the
//! USB/IP framing used on data tunnels.

pub mod error;
pub mod jsonrpc;
pub mod messages;
pub mod types;
pub mod usbip;

pub use error::{ErrorKind, ErrorObject, ModelError, RpcError, UsbIpError};
pub use jsonrpc::{Channel, Incoming, RpcService, Side, T_DEAD, T_IDLE};
pub use messages::{
    HubNotification, HubRequest, PlaceAvailable, PlaceReserved, PlaceReturned, RegisterExporter,
    ReservationLost, Reserve, ReturnReservation,
};
pub use types::{
    ExportDesc, ImportSpec, Part, PartSpec, Place, ReturnReason, TcpIface, TcpImport, UsbId,
    UsbIface, UsbImport,
};
