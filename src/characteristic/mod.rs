//! The characteristic data model: formats, constraints, permissions, and the accessory catalog.
//!
//! The catalog (accessories → services → characteristics) is input data supplied by the
//! application at server start. Services reference linked services by instance id, never by
//! pointer, so the catalog is a plain tree of `&'static` tables and lookup goes through the
//! iid index.
//!
//! A characteristic's format and its format-specific constraints form one tagged variant,
//! [`FormatSpec`]; the transport-independent header (iid, type, properties, unit) is the outer
//! record.
//!
//! [`FormatSpec`]: enum.FormatSpec.html

pub mod value;

use crate::uuid::HapUuid;
use crate::HapError;
use bitflags::bitflags;

pub use value::Value;

/// Maximum instance id usable on the BLE transport.
pub const MAX_BLE_IID: u64 = u16::max_value() as u64;

bitflags! {
    /// Static capabilities and access rules of a characteristic.
    pub struct Properties: u16 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const SUPPORTS_EVENT_NOTIFICATION = 1 << 2;
        const REQUIRES_TIMED_WRITE = 1 << 3;
        const SUPPORTS_WRITE_RESPONSE = 1 << 4;
        const SUPPORTS_BROADCAST_NOTIFICATION = 1 << 5;
        const SUPPORTS_DISCONNECTED_NOTIFICATION = 1 << 6;
        const READABLE_WITHOUT_SECURITY = 1 << 7;
        const WRITABLE_WITHOUT_SECURITY = 1 << 8;
        const HIDDEN = 1 << 9;
        const ADMIN_ONLY_READ = 1 << 10;
        const ADMIN_ONLY_WRITE = 1 << 11;
        const SUPPORTS_AUTHORIZATION_DATA = 1 << 12;
    }
}

impl Properties {
    /// Encodes the HAP-BLE characteristic properties bitfield used in signature responses.
    pub fn ble_bits(&self) -> u16 {
        let mut bits = 0;
        if self.contains(Properties::READABLE_WITHOUT_SECURITY) {
            bits |= 0x0001;
        }
        if self.contains(Properties::WRITABLE_WITHOUT_SECURITY) {
            bits |= 0x0002;
        }
        if self.contains(Properties::SUPPORTS_AUTHORIZATION_DATA) {
            bits |= 0x0004;
        }
        if self.contains(Properties::REQUIRES_TIMED_WRITE) {
            bits |= 0x0008;
        }
        if self.contains(Properties::READABLE) {
            bits |= 0x0010;
        }
        if self.contains(Properties::WRITABLE) {
            bits |= 0x0020;
        }
        if self.contains(Properties::HIDDEN) {
            bits |= 0x0040;
        }
        if self.contains(Properties::SUPPORTS_EVENT_NOTIFICATION) {
            bits |= 0x0080;
        }
        if self.contains(Properties::SUPPORTS_DISCONNECTED_NOTIFICATION) {
            bits |= 0x0100;
        }
        if self.contains(Properties::SUPPORTS_BROADCAST_NOTIFICATION) {
            bits |= 0x0200;
        }
        bits
    }
}

enum_with_unknown! {
    /// Unit of a numeric characteristic, reported through the GATT presentation format
    /// descriptor.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Unit(u16) {
        /// Unitless (BT SIG 0x2700).
        None = 0x2700,
        Celsius = 0x272F,
        ArcDegrees = 0x2763,
        Seconds = 0x2703,
        Lux = 0x2731,
        Percentage = 0x27AD,
    }
}

/// Numeric range constraints; a `None` bound is unconstrained.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Range<T: Copy> {
    pub min: Option<T>,
    pub max: Option<T>,
    /// Advisory step; not enforced at the protocol layer.
    pub step: Option<T>,
}

impl<T: Copy> Range<T> {
    pub const UNCONSTRAINED: Self = Range {
        min: None,
        max: None,
        step: None,
    };
}

/// Default `maxLength` of a `string` characteristic.
pub const DEFAULT_STRING_MAX_LEN: u16 = 64;

/// Default `maxLength` of a `data` characteristic.
pub const DEFAULT_DATA_MAX_LEN: u32 = 2_097_152;

/// A characteristic's format together with its format-specific constraints.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatSpec {
    Bool,
    UInt8 {
        range: Range<u8>,
        /// Permitted values, sorted strictly ascending; empty means unrestricted.
        valid_values: &'static [u8],
        /// Permitted closed ranges, sorted and non-overlapping; empty means unrestricted.
        valid_values_ranges: &'static [(u8, u8)],
    },
    UInt16 {
        range: Range<u16>,
    },
    UInt32 {
        range: Range<u32>,
    },
    UInt64 {
        range: Range<u64>,
    },
    Int32 {
        range: Range<i32>,
    },
    Float32 {
        range: Range<f32>,
    },
    String {
        max_len: u16,
    },
    Tlv8,
    Data {
        max_len: u32,
    },
}

impl FormatSpec {
    /// GATT presentation format code for this format.
    pub fn gatt_format(&self) -> u8 {
        match self {
            FormatSpec::Bool => 0x01,
            FormatSpec::UInt8 { .. } => 0x04,
            FormatSpec::UInt16 { .. } => 0x06,
            FormatSpec::UInt32 { .. } => 0x08,
            FormatSpec::UInt64 { .. } => 0x0A,
            FormatSpec::Int32 { .. } => 0x10,
            FormatSpec::Float32 { .. } => 0x14,
            FormatSpec::String { .. } => 0x19,
            FormatSpec::Tlv8 | FormatSpec::Data { .. } => 0x1B,
        }
    }
}

/// Immutable description of one characteristic instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    pub iid: u64,
    pub type_: HapUuid,
    pub properties: Properties,
    pub unit: Unit,
    pub format: FormatSpec,
}

impl Characteristic {
    /// Whether the characteristic's value only exists at the moment an event fires.
    ///
    /// `ProgrammableSwitchEvent` is the canonical case: IP reads of it always return null and
    /// only event notifications carry a value.
    pub fn value_is_event_only(&self) -> bool {
        self.type_ == HapUuid::apple_defined(0x73)
    }
}

bitflags! {
    /// Service-level properties reported by Service-Signature-Read.
    pub struct ServiceProperties: u16 {
        const PRIMARY = 1 << 0;
        const HIDDEN = 1 << 1;
        const SUPPORTS_CONFIGURATION = 1 << 2;
    }
}

/// A service: a group of characteristics plus links to related services.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub iid: u64,
    pub type_: HapUuid,
    pub properties: ServiceProperties,
    /// Instance ids of linked services; resolved through the catalog, by value.
    pub linked_services: &'static [u64],
    pub characteristics: &'static [Characteristic],
}

/// One accessory: the root of a service tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Accessory {
    pub aid: u64,
    pub services: &'static [Service],
}

impl Accessory {
    /// Looks up a characteristic by instance id, together with its containing service.
    pub fn characteristic(&self, iid: u64) -> Option<(&Service, &Characteristic)> {
        self.services.iter().find_map(|service| {
            service
                .characteristics
                .iter()
                .find(|c| c.iid == iid)
                .map(|c| (service, c))
        })
    }

    /// Looks up a service by instance id.
    pub fn service(&self, iid: u64) -> Option<&Service> {
        self.services.iter().find(|s| s.iid == iid)
    }

    /// Total number of characteristics, bounding the subscription bitset.
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// Stable ordinal of a characteristic, derived from catalog order.
    ///
    /// Subscription bitsets are keyed by this ordinal rather than the sparse iid.
    pub fn ordinal_of(&self, iid: u64) -> Option<usize> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .position(|c| c.iid == iid)
    }

    /// The characteristic at a given ordinal (inverse of [`ordinal_of`]).
    ///
    /// [`ordinal_of`]: #method.ordinal_of
    pub fn characteristic_at(&self, ordinal: usize) -> Option<&Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .nth(ordinal)
    }
}

/// Application-side characteristic handlers.
///
/// The executor calls into this trait once a request has passed permission and constraint
/// checks. Values returned by [`read`] borrow from the delegate, so the application can serve
/// them from its own state without copies.
///
/// [`read`]: #tymethod.read
pub trait Delegate {
    /// Produces the current value of a characteristic.
    fn read<'a>(
        &'a mut self,
        aid: u64,
        characteristic: &Characteristic,
    ) -> Result<Value<'a>, HapError>;

    /// Applies a validated write.
    fn write(
        &mut self,
        aid: u64,
        characteristic: &Characteristic,
        value: Value<'_>,
    ) -> Result<(), HapError>;

    /// A controller subscribed to event notifications.
    fn subscribe(&mut self, _aid: u64, _characteristic: &Characteristic) {}

    /// A controller dropped its event subscription.
    fn unsubscribe(&mut self, _aid: u64, _characteristic: &Characteristic) {}
}

/// The operation a controller requests on a characteristic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    TimedWrite,
    Subscribe,
}

/// Access rights of the requesting session, as seen by the permission check.
#[derive(Debug, Copy, Clone)]
pub struct AccessContext {
    /// Pair Verify (or transient Pair Setup) completed on this session.
    pub session_active: bool,
    /// The session's pairing has the admin permission bit.
    pub admin: bool,
    /// An `authData` TLV accompanied the request.
    pub has_auth_data: bool,
    /// An `origin` TLV accompanied the request.
    pub has_origin: bool,
}

/// Checks whether `op` on `characteristic` is permitted in `ctx`.
///
/// Mirrors the transport-independent rules: security requirements first, then admin-only
/// restrictions, then the timed-write and authorization-data shape checks.
pub fn authorize(
    characteristic: &Characteristic,
    op: Operation,
    ctx: &AccessContext,
) -> Result<(), HapError> {
    let props = characteristic.properties;

    let (supported, without_security, admin_only) = match op {
        Operation::Read => (
            props.contains(Properties::READABLE),
            props.contains(Properties::READABLE_WITHOUT_SECURITY),
            props.contains(Properties::ADMIN_ONLY_READ),
        ),
        Operation::Write | Operation::TimedWrite => (
            props.contains(Properties::WRITABLE),
            props.contains(Properties::WRITABLE_WITHOUT_SECURITY),
            props.contains(Properties::ADMIN_ONLY_WRITE),
        ),
        Operation::Subscribe => (
            props.contains(Properties::SUPPORTS_EVENT_NOTIFICATION),
            false,
            false,
        ),
    };

    if !supported {
        return Err(HapError::InvalidState);
    }
    if !ctx.session_active && !without_security {
        return Err(HapError::NotAuthorized);
    }
    if admin_only && !ctx.admin {
        return Err(HapError::NotAuthorized);
    }
    if op == Operation::Write && props.contains(Properties::REQUIRES_TIMED_WRITE) {
        // Direct writes are forbidden on timed-write characteristics.
        return Err(HapError::InvalidData);
    }
    if ctx.has_auth_data {
        if !props.contains(Properties::SUPPORTS_AUTHORIZATION_DATA) {
            return Err(HapError::NotAuthorized);
        }
        if !ctx.has_origin {
            return Err(HapError::InvalidData);
        }
    }
    Ok(())
}
