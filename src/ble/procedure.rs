//! The BLE procedure dispatcher: maps decoded request PDUs onto characteristic and service
//! operations and serializes the response bodies.
//!
//! Request and response bodies are TLVs using the HAP-Param type space (`param` below). The
//! dispatcher owns the transport-specific rules (status codes, signature bodies, timed writes);
//! value validation and permission checks are delegated to the [`characteristic`] executor.
//!
//! [`characteristic`]: ../../characteristic/index.html

use crate::bytes::{ByteWriter, ToBytes};
use crate::characteristic::{
    authorize, value, AccessContext, Accessory, Characteristic, Delegate, FormatSpec, Operation,
    Service,
};
use crate::pairing::PairingStore;
use crate::platform::PlatformConfig;
use crate::session::Session;
use crate::time::{Duration, Instant};
use crate::tlv::{TlvReader, TlvWriter};
use crate::{Error, HapError};

use super::broadcast;
use super::pdu::{Opcode, Status};
use super::transaction::Transaction;

/// HAP-Param TLV types used in PDU bodies.
pub mod param {
    pub const VALUE: u8 = 0x01;
    pub const AUTHORIZATION_DATA: u8 = 0x02;
    pub const ORIGIN: u8 = 0x03;
    pub const CHARACTERISTIC_TYPE: u8 = 0x04;
    pub const CHARACTERISTIC_INSTANCE_ID: u8 = 0x05;
    pub const SERVICE_TYPE: u8 = 0x06;
    pub const SERVICE_INSTANCE_ID: u8 = 0x07;
    pub const TTL: u8 = 0x08;
    pub const RETURN_RESPONSE: u8 = 0x09;
    pub const PROPERTIES: u8 = 0x0A;
    pub const USER_DESCRIPTION: u8 = 0x0B;
    pub const PRESENTATION_FORMAT: u8 = 0x0C;
    pub const VALID_RANGE: u8 = 0x0D;
    pub const STEP_VALUE: u8 = 0x0E;
    pub const SERVICE_PROPERTIES: u8 = 0x0F;
    pub const LINKED_SERVICES: u8 = 0x10;
    pub const VALID_VALUES: u8 = 0x11;
    pub const VALID_VALUES_RANGE: u8 = 0x12;
}

/// Characteristic-Configuration TLV types.
mod config_tlv {
    pub const PROPERTIES: u8 = 0x01;
    pub const BROADCAST_INTERVAL: u8 = 0x02;

    /// Bit 0 of the properties field: broadcasts enabled.
    pub const PROPERTY_BROADCASTS: u16 = 1 << 0;
}

/// Protocol-Configuration TLV types (request and response).
mod protocol_tlv {
    pub const GENERATE_BROADCAST_KEY: u8 = 0x01;
    pub const GET_ALL: u8 = 0x02;
    pub const SET_ADVERTISING_ID: u8 = 0x03;

    pub const CURRENT_STATE_NUMBER: u8 = 0x01;
    pub const CURRENT_CONFIG_NUMBER: u8 = 0x02;
    pub const ADVERTISING_ID: u8 = 0x03;
    pub const BROADCAST_KEY: u8 = 0x04;
}

/// Largest value held by a pending timed write.
pub const MAX_TIMED_WRITE_BYTES: usize = 512;

/// A parsed, not yet committed timed write.
pub struct TimedWrite {
    pub iid: u16,
    pub deadline: Instant,
    value: [u8; MAX_TIMED_WRITE_BYTES],
    value_len: usize,
}

/// Everything a procedure needs from the server for one request.
pub struct Context<'a, C: PlatformConfig, D: Delegate> {
    pub store: &'a mut C::Store,
    pub now: Instant,
    pub accessory: &'a Accessory,
    pub session: &'a mut Session,
    pub delegate: &'a mut D,
    pub timed_write: &'a mut Option<TimedWrite>,
    /// BLE Global State Number, for Protocol-Configuration responses.
    pub gsn: u16,
    /// Configuration number (CN).
    pub config_number: u8,
    pub advertising_id: [u8; 6],
}

enum Failure {
    Status(Status),
    Hap(HapError),
}

impl From<HapError> for Failure {
    fn from(e: HapError) -> Self {
        Failure::Hap(e)
    }
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Failure::Hap(e.into())
    }
}

fn status_of(session_active: bool, failure: Failure) -> Status {
    match failure {
        Failure::Status(status) => status,
        Failure::Hap(HapError::NotAuthorized) if !session_active => {
            Status::InsufficientAuthentication
        }
        Failure::Hap(HapError::NotAuthorized) => Status::InsufficientAuthorization,
        Failure::Hap(HapError::Authentication) => Status::InsufficientAuthentication,
        Failure::Hap(HapError::Busy) => Status::MaxProcedures,
        Failure::Hap(_) => Status::InvalidRequest,
    }
}

/// Dispatches the completed request in `tx` and arms its response.
pub fn dispatch<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    tx: &mut Transaction<'_>,
) -> Result<(), HapError> {
    let opcode = tx.opcode();
    let iid = tx.iid();
    let tid = tx.tid();
    debug!("BLE procedure {:?} (tid {:#04x}, iid {})", opcode, tid, iid);

    let (request, response) = tx.split();
    let mut writer = TlvWriter::new(response);
    let result = run(ctx, opcode, iid, request, &mut writer);

    let (status, body_len) = match result {
        Ok(()) => (Status::Success, writer.finish()),
        Err(failure) => (status_of(ctx.session.is_active(), failure), 0),
    };
    tx.set_response(status, body_len)
}

fn run<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    opcode: Opcode,
    iid: u16,
    request: &[u8],
    writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    let reader = TlvReader::new(request);
    reader.validate().map_err(|_| Failure::Status(Status::InvalidRequest))?;

    // Transient sessions exist to carry the split Pair Setup exchange, nothing else.
    if ctx.session.transient {
        return Err(Failure::Status(Status::InsufficientAuthentication));
    }

    match opcode {
        Opcode::CharacteristicSignatureRead => characteristic_signature_read(ctx, iid, writer),
        Opcode::CharacteristicRead => characteristic_read(ctx, iid, &reader, writer),
        Opcode::CharacteristicWrite => characteristic_write(ctx, iid, &reader, writer),
        Opcode::CharacteristicTimedWrite => timed_write(ctx, iid, &reader),
        Opcode::CharacteristicExecuteWrite => execute_write(ctx, iid, writer),
        Opcode::ServiceSignatureRead => service_signature_read(ctx, iid, writer),
        Opcode::CharacteristicConfiguration => characteristic_configuration(ctx, iid, &reader, writer),
        Opcode::ProtocolConfiguration => protocol_configuration(ctx, iid, &reader, writer),
        Opcode::Token | Opcode::TokenUpdate | Opcode::Info => {
            // Software token authentication is not supported.
            Err(Failure::Status(Status::UnsupportedPdu))
        }
        Opcode::Unknown(raw) => {
            info!("unsupported opcode {:#04x}", raw);
            Err(Failure::Status(Status::UnsupportedPdu))
        }
    }
}

fn find_characteristic<'a>(
    accessory: &'a Accessory,
    iid: u16,
) -> Result<(&'a Service, &'a Characteristic), Failure> {
    accessory
        .characteristic(u64::from(iid))
        .ok_or(Failure::Status(Status::InvalidInstanceId))
}

fn access_context<C: PlatformConfig>(
    store: &C::Store,
    session: &Session,
    reader: Option<&TlvReader<'_>>,
) -> Result<AccessContext, Failure> {
    let admin = match session.pairing_slot {
        Some(slot) => PairingStore::get(store, slot)?
            .map(|p| p.is_admin())
            .unwrap_or(false),
        None => false,
    };
    let (has_auth_data, has_origin) = match reader {
        Some(reader) => (
            reader.find(param::AUTHORIZATION_DATA).is_some(),
            reader.find(param::ORIGIN).is_some(),
        ),
        None => (false, false),
    };
    Ok(AccessContext {
        session_active: session.is_active(),
        admin,
        has_auth_data,
        has_origin,
    })
}

fn characteristic_signature_read<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    let (service, characteristic) = find_characteristic(ctx.accessory, iid)?;

    append_uuid(writer, param::CHARACTERISTIC_TYPE, &characteristic.type_)?;
    writer.append(
        param::SERVICE_INSTANCE_ID,
        &(service.iid as u16).to_le_bytes(),
    )?;
    append_uuid(writer, param::SERVICE_TYPE, &service.type_)?;
    writer.append(
        param::PROPERTIES,
        &characteristic.properties.ble_bits().to_le_bytes(),
    )?;

    // GATT presentation format descriptor: format, exponent, unit, namespace, description.
    let presentation = [
        characteristic.format.gatt_format(),
        0,
        u16::from(characteristic.unit).to_le_bytes()[0],
        u16::from(characteristic.unit).to_le_bytes()[1],
        1,
        0,
        0,
    ];
    writer.append(param::PRESENTATION_FORMAT, &presentation)?;

    append_constraints(writer, &characteristic.format)?;
    Ok(())
}

fn append_uuid(writer: &mut TlvWriter<'_>, ty: u8, uuid: &crate::uuid::HapUuid) -> Result<(), Failure> {
    let mut bytes = [0; 16];
    let mut w = ByteWriter::new(&mut bytes);
    uuid.to_bytes(&mut w).map_err(Error::from)?;
    writer.append(ty, &bytes)?;
    Ok(())
}

/// Appends the valid range, step and valid-values descriptors appropriate for the format.
fn append_constraints(writer: &mut TlvWriter<'_>, format: &FormatSpec) -> Result<(), Failure> {
    fn range_bytes<T, const W: usize>(
        writer: &mut TlvWriter<'_>,
        range: &crate::characteristic::Range<T>,
        natural_min: T,
        natural_max: T,
        encode: impl Fn(T) -> [u8; W],
    ) -> Result<(), Error>
    where
        T: Copy,
    {
        if range.min.is_some() || range.max.is_some() {
            let mut bytes = [0; 32];
            let mut w = ByteWriter::new(&mut bytes);
            w.write_slice(&encode(range.min.unwrap_or(natural_min)))?;
            w.write_slice(&encode(range.max.unwrap_or(natural_max)))?;
            let used = 2 * W;
            writer.append(param::VALID_RANGE, &bytes[..used])?;
        }
        if let Some(step) = range.step {
            writer.append(param::STEP_VALUE, &encode(step))?;
        }
        Ok(())
    }

    match format {
        FormatSpec::UInt8 {
            range,
            valid_values,
            valid_values_ranges,
        } => {
            range_bytes(writer, range, 0, u8::max_value(), |v: u8| [v])?;
            if !valid_values.is_empty() {
                writer.append(param::VALID_VALUES, valid_values)?;
            }
            if !valid_values_ranges.is_empty() {
                let mut bytes = [0; 2 * 8];
                for (i, (lo, hi)) in valid_values_ranges.iter().take(8).enumerate() {
                    bytes[2 * i] = *lo;
                    bytes[2 * i + 1] = *hi;
                }
                writer.append(
                    param::VALID_VALUES_RANGE,
                    &bytes[..2 * valid_values_ranges.len().min(8)],
                )?;
            }
        }
        FormatSpec::UInt16 { range } => {
            range_bytes(writer, range, 0, u16::max_value(), |v: u16| v.to_le_bytes())?
        }
        FormatSpec::UInt32 { range } => {
            range_bytes(writer, range, 0, u32::max_value(), |v: u32| v.to_le_bytes())?
        }
        FormatSpec::UInt64 { range } => {
            range_bytes(writer, range, 0, u64::max_value(), |v: u64| v.to_le_bytes())?
        }
        FormatSpec::Int32 { range } => range_bytes(
            writer,
            range,
            i32::min_value(),
            i32::max_value(),
            |v: i32| v.to_le_bytes(),
        )?,
        FormatSpec::Float32 { range } => range_bytes(
            writer,
            range,
            f32::MIN,
            f32::MAX,
            |v: f32| v.to_bits().to_le_bytes(),
        )?,
        FormatSpec::Bool
        | FormatSpec::String { .. }
        | FormatSpec::Tlv8
        | FormatSpec::Data { .. } => {}
    }
    Ok(())
}

fn characteristic_read<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    reader: &TlvReader<'_>,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    let (_, characteristic) = find_characteristic(ctx.accessory, iid)?;
    let access = access_context::<C>(ctx.store, ctx.session, Some(reader))?;
    authorize(characteristic, Operation::Read, &access)?;

    let aid = ctx.accessory.aid;
    let value = ctx.delegate.read(aid, characteristic)?;
    append_value(writer, &value)?;
    Ok(())
}

fn append_value(writer: &mut TlvWriter<'_>, value: &value::Value<'_>) -> Result<(), Failure> {
    writer.with_scratch(MAX_TIMED_WRITE_BYTES, |writer, scratch| {
        let total = scratch.len();
        let mut w = ByteWriter::new(&mut scratch[..]);
        value.to_bytes(&mut w)?;
        let used = total - w.space_left();
        writer.append(param::VALUE, &scratch[..used])
    })?;
    Ok(())
}

fn characteristic_write<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    reader: &TlvReader<'_>,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    let (_, characteristic) = find_characteristic(ctx.accessory, iid)?;
    let access = access_context::<C>(ctx.store, ctx.session, Some(reader))?;
    authorize(characteristic, Operation::Write, &access)?;

    let value_tlv = reader
        .find(param::VALUE)
        .ok_or(Failure::Status(Status::InvalidRequest))?;
    let mut buf = [0; MAX_TIMED_WRITE_BYTES];
    let bytes = value_tlv.copy_into(&mut buf).map_err(Error::from)?;
    let value = value::parse(&characteristic.format, bytes)?;

    let aid = ctx.accessory.aid;
    ctx.delegate.write(aid, characteristic, value)?;

    let wants_response = reader
        .find(param::RETURN_RESPONSE)
        .map(|v| v.parse_u8() == Ok(1))
        .unwrap_or(false);
    if wants_response
        && characteristic
            .properties
            .contains(crate::characteristic::Properties::SUPPORTS_WRITE_RESPONSE)
    {
        let value = ctx.delegate.read(aid, characteristic)?;
        append_value(writer, &value)?;
    }
    Ok(())
}

fn timed_write<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    reader: &TlvReader<'_>,
) -> Result<(), Failure> {
    let (_, characteristic) = find_characteristic(ctx.accessory, iid)?;
    let access = access_context::<C>(ctx.store, ctx.session, Some(reader))?;
    authorize(characteristic, Operation::TimedWrite, &access)?;

    let ttl = reader
        .find(param::TTL)
        .ok_or(Failure::Status(Status::InvalidRequest))?
        .parse_u8()
        .map_err(Error::from)?;
    let value_tlv = reader
        .find(param::VALUE)
        .ok_or(Failure::Status(Status::InvalidRequest))?;

    let mut pending = TimedWrite {
        iid,
        deadline: ctx.now + Duration::from_millis(u32::from(ttl) * 100),
        value: [0; MAX_TIMED_WRITE_BYTES],
        value_len: 0,
    };
    if value_tlv.len() > MAX_TIMED_WRITE_BYTES {
        return Err(Failure::Status(Status::InvalidRequest));
    }
    value_tlv.copy_into(&mut pending.value).map_err(Error::from)?;
    pending.value_len = value_tlv.len();

    // Validate eagerly so an expired execute never commits garbage.
    value::parse(&characteristic.format, &pending.value[..pending.value_len])?;

    *ctx.timed_write = Some(pending);
    Ok(())
}

fn execute_write<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    _writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    let pending = match ctx.timed_write.take() {
        Some(pending) => pending,
        None => {
            info!("execute-write without a pending timed write");
            return Err(Failure::Status(Status::InvalidRequest));
        }
    };
    if pending.iid != iid {
        return Err(Failure::Status(Status::InvalidRequest));
    }
    if ctx.now > pending.deadline {
        info!("timed write expired; dropping");
        return Err(Failure::Status(Status::InvalidRequest));
    }

    let (_, characteristic) = find_characteristic(ctx.accessory, iid)?;
    let access = access_context::<C>(ctx.store, ctx.session, None)?;
    authorize(characteristic, Operation::TimedWrite, &access)?;

    let value = value::parse(&characteristic.format, &pending.value[..pending.value_len])?;
    let aid = ctx.accessory.aid;
    ctx.delegate.write(aid, characteristic, value)?;
    Ok(())
}

fn service_signature_read<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    let service = ctx
        .accessory
        .service(u64::from(iid))
        .ok_or(Failure::Status(Status::InvalidInstanceId))?;

    writer.append(
        param::SERVICE_PROPERTIES,
        &service.properties.bits().to_le_bytes(),
    )?;

    let mut linked = [0; 2 * 16];
    let count = service.linked_services.len().min(16);
    for (i, iid) in service.linked_services.iter().take(count).enumerate() {
        linked[2 * i..2 * i + 2].copy_from_slice(&(*iid as u16).to_le_bytes());
    }
    writer.append(param::LINKED_SERVICES, &linked[..2 * count])?;
    Ok(())
}

fn characteristic_configuration<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    reader: &TlvReader<'_>,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    let (_, characteristic) = find_characteristic(ctx.accessory, iid)?;
    if !ctx.session.is_active() {
        return Err(Failure::Status(Status::InsufficientAuthentication));
    }

    if let Some(properties) = reader.find(config_tlv::PROPERTIES) {
        let bits = properties.parse_uint_le().map_err(Error::from)? as u16;
        let enable = bits & config_tlv::PROPERTY_BROADCASTS != 0;

        if enable {
            if !characteristic.properties.contains(
                crate::characteristic::Properties::SUPPORTS_BROADCAST_NOTIFICATION,
            ) {
                return Err(Failure::Status(Status::InvalidRequest));
            }
            let interval = match reader.find(config_tlv::BROADCAST_INTERVAL) {
                None => broadcast::Interval::Ms20,
                Some(v) => {
                    let raw = v.parse_u8().map_err(Error::from)?;
                    if !broadcast::Interval::is_valid(raw) {
                        return Err(Failure::Status(Status::InvalidRequest));
                    }
                    broadcast::Interval::from(raw)
                }
            };
            broadcast::enable(ctx.store, ctx.accessory.aid, iid, interval)?;
        } else {
            broadcast::disable(ctx.store, ctx.accessory.aid, iid)?;
        }
    }

    // Respond with the current configuration.
    let config = broadcast::Config::load(ctx.store, ctx.accessory.aid)?;
    match config.interval_of(iid) {
        Some(interval) => {
            writer.append(
                config_tlv::PROPERTIES,
                &config_tlv::PROPERTY_BROADCASTS.to_le_bytes(),
            )?;
            writer.append_u8(config_tlv::BROADCAST_INTERVAL, interval.into())?;
        }
        None => {
            writer.append(config_tlv::PROPERTIES, &0u16.to_le_bytes())?;
        }
    }
    Ok(())
}

fn protocol_configuration<C: PlatformConfig, D: Delegate>(
    ctx: &mut Context<'_, C, D>,
    iid: u16,
    reader: &TlvReader<'_>,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Failure> {
    ctx.accessory
        .service(u64::from(iid))
        .ok_or(Failure::Status(Status::InvalidInstanceId))?;
    if !ctx.session.is_active() {
        return Err(Failure::Status(Status::InsufficientAuthentication));
    }

    if let Some(id) = reader.find(protocol_tlv::SET_ADVERTISING_ID) {
        if id.len() != 6 {
            return Err(Failure::Status(Status::InvalidRequest));
        }
        let mut bytes = [0; 6];
        id.copy_into(&mut bytes).map_err(Error::from)?;
        broadcast::set_advertising_id(ctx.store, &bytes)?;
        ctx.advertising_id = bytes;
    }

    let generate = reader.find(protocol_tlv::GENERATE_BROADCAST_KEY).is_some();
    if generate {
        broadcast::generate_key(
            ctx.store,
            &ctx.session.shared_secret,
            &ctx.advertising_id,
            ctx.gsn,
        )?;
    }

    writer.append(
        protocol_tlv::CURRENT_STATE_NUMBER,
        &ctx.gsn.to_le_bytes(),
    )?;
    writer.append_u8(protocol_tlv::CURRENT_CONFIG_NUMBER, ctx.config_number)?;
    writer.append(protocol_tlv::ADVERTISING_ID, &ctx.advertising_id)?;
    if let Some(key) = broadcast::key(ctx.store)? {
        writer.append(protocol_tlv::BROADCAST_KEY, &key.bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::{
        Accessory, Characteristic, Properties, Range, Service, ServiceProperties, Unit, Value,
    };
    use crate::platform::test::{MemoryStore, TestConfig};
    use crate::session::{Session, Transport};
    use crate::tlv::TlvReader;
    use crate::uuid::HapUuid;

    struct TestDelegate {
        on: bool,
        brightness: u8,
        writes: usize,
    }

    impl Delegate for TestDelegate {
        fn read<'a>(
            &'a mut self,
            _aid: u64,
            characteristic: &Characteristic,
        ) -> Result<Value<'a>, HapError> {
            match characteristic.iid {
                13 => Ok(Value::Bool(self.on)),
                14 => Ok(Value::UInt8(self.brightness)),
                _ => Err(HapError::InvalidState),
            }
        }

        fn write(
            &mut self,
            _aid: u64,
            characteristic: &Characteristic,
            value: Value<'_>,
        ) -> Result<(), HapError> {
            self.writes += 1;
            match (characteristic.iid, value) {
                (13, Value::Bool(v)) => self.on = v,
                (14, Value::UInt8(v)) => self.brightness = v,
                _ => return Err(HapError::InvalidData),
            }
            Ok(())
        }
    }

    fn catalog() -> &'static Accessory {
        let characteristics: &'static [Characteristic] = Box::leak(Box::new([
            Characteristic {
                iid: 13,
                type_: HapUuid::apple_defined(0x25),
                properties: Properties::READABLE
                    | Properties::WRITABLE
                    | Properties::SUPPORTS_EVENT_NOTIFICATION
                    | Properties::SUPPORTS_BROADCAST_NOTIFICATION
                    | Properties::SUPPORTS_WRITE_RESPONSE,
                unit: Unit::None,
                format: FormatSpec::Bool,
            },
            Characteristic {
                iid: 14,
                type_: HapUuid::apple_defined(0x08),
                properties: Properties::READABLE
                    | Properties::WRITABLE
                    | Properties::SUPPORTS_EVENT_NOTIFICATION,
                unit: Unit::Percentage,
                format: FormatSpec::UInt8 {
                    range: Range {
                        min: Some(0),
                        max: Some(100),
                        step: Some(1),
                    },
                    valid_values: &[],
                    valid_values_ranges: &[],
                },
            },
            Characteristic {
                iid: 15,
                type_: HapUuid::apple_defined(0x4A),
                properties: Properties::WRITABLE | Properties::REQUIRES_TIMED_WRITE,
                unit: Unit::None,
                format: FormatSpec::UInt8 {
                    range: Range::UNCONSTRAINED,
                    valid_values: &[],
                    valid_values_ranges: &[],
                },
            },
        ]));
        let services: &'static [Service] = Box::leak(Box::new([Service {
            iid: 10,
            type_: HapUuid::apple_defined(0x43),
            properties: ServiceProperties::PRIMARY,
            linked_services: &[16],
            characteristics,
        }]));
        Box::leak(Box::new(Accessory { aid: 1, services }))
    }

    struct Harness {
        store: MemoryStore,
        session: Session,
        delegate: TestDelegate,
        timed_write: Option<TimedWrite>,
        accessory: &'static Accessory,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let mut session = Session::new(Transport::Ble);
            session.open(&[0x77; 32], 0);
            let mut store = MemoryStore::new();
            let pairing = crate::pairing::Pairing::new(
                b"ctrl",
                [1; 32],
                crate::pairing::Permissions::ADMIN,
            )
            .unwrap();
            crate::pairing::PairingStore::set(&mut store, 0, &pairing).unwrap();
            Harness {
                store,
                session,
                delegate: TestDelegate {
                    on: false,
                    brightness: 25,
                    writes: 0,
                },
                timed_write: None,
                accessory: catalog(),
                now: Instant::from_raw_millis(10_000),
            }
        }

        /// Runs one complete request and returns `(status, body)`.
        fn run(&mut self, opcode: u8, iid: u16, body: &[u8]) -> (Status, Vec<u8>) {
            let mut request_buf = [0; 1024];
            let mut response_buf = [0; 2048];
            let mut tx = Transaction::new(&mut request_buf, &mut response_buf);

            let mut pdu = vec![0x00, opcode, 0x42];
            pdu.extend_from_slice(&iid.to_le_bytes());
            if !body.is_empty() {
                pdu.extend_from_slice(&(body.len() as u16).to_le_bytes());
                pdu.extend_from_slice(body);
            }
            tx.handle_write(&pdu).unwrap();

            let mut ctx = Context::<TestConfig, TestDelegate> {
                store: &mut self.store,
                now: self.now,
                accessory: self.accessory,
                session: &mut self.session,
                delegate: &mut self.delegate,
                timed_write: &mut self.timed_write,
                gsn: 77,
                config_number: 3,
                advertising_id: [9, 8, 7, 6, 5, 4],
            };
            dispatch(&mut ctx, &mut tx).unwrap();

            let mut out = [0; 4096];
            let mut body = Vec::new();
            let mut status = Status::Success;
            let mut first = true;
            loop {
                let (len, is_final) = tx.pop_read_fragment(512, &mut out).unwrap();
                let fragment = &out[..len];
                if first {
                    status = Status::from(fragment[2]);
                    if len > 3 {
                        body.extend_from_slice(&fragment[5..]);
                    }
                    first = false;
                } else {
                    body.extend_from_slice(&fragment[2..]);
                }
                if is_final {
                    break;
                }
            }
            (status, body)
        }

        fn tlv_body(&mut self, opcode: u8, iid: u16, body: &[u8]) -> Vec<u8> {
            let (status, body) = self.run(opcode, iid, body);
            assert_eq!(status, Status::Success);
            body
        }
    }

    fn tlv(pairs: &[(u8, &[u8])]) -> Vec<u8> {
        let mut buf = [0; 1024];
        let mut writer = TlvWriter::new(&mut buf);
        for (ty, value) in pairs {
            writer.append(*ty, value).unwrap();
        }
        let len = writer.finish();
        buf[..len].to_vec()
    }

    #[test]
    fn signature_read_describes_the_characteristic() {
        let mut harness = Harness::new();
        let body = harness.tlv_body(0x01, 14, &[]);
        let reader = TlvReader::new(&body);

        let ty = reader.find(param::CHARACTERISTIC_TYPE).unwrap();
        assert_eq!(ty.len(), 16);
        let svc = reader.find(param::SERVICE_INSTANCE_ID).unwrap();
        assert_eq!(svc.parse_uint_le().unwrap(), 10);

        let props = reader.find(param::PROPERTIES).unwrap();
        let bits = props.parse_uint_le().unwrap() as u16;
        assert_ne!(bits & 0x0010, 0); // readable
        assert_ne!(bits & 0x0020, 0); // writable
        assert_ne!(bits & 0x0080, 0); // notifies in connected state

        let format = reader.find(param::PRESENTATION_FORMAT).unwrap();
        let mut fmt = [0; 7];
        format.copy_into(&mut fmt).unwrap();
        assert_eq!(fmt[0], 0x04); // uint8
        assert_eq!(u16::from_le_bytes([fmt[2], fmt[3]]), 0x27AD); // percentage

        let range = reader.find(param::VALID_RANGE).unwrap();
        let mut bytes = [0; 2];
        range.copy_into(&mut bytes).unwrap();
        assert_eq!(bytes, [0, 100]);

        let step = reader.find(param::STEP_VALUE).unwrap();
        assert_eq!(step.parse_u8().unwrap(), 1);
    }

    #[test]
    fn signature_read_of_unknown_iid() {
        let mut harness = Harness::new();
        let (status, _) = harness.run(0x01, 99, &[]);
        assert_eq!(status, Status::InvalidInstanceId);
    }

    #[test]
    fn read_returns_the_value() {
        let mut harness = Harness::new();
        harness.delegate.brightness = 42;
        let body = harness.tlv_body(0x03, 14, &[]);
        let reader = TlvReader::new(&body);
        assert_eq!(reader.find(param::VALUE).unwrap().parse_u8().unwrap(), 42);
    }

    #[test]
    fn read_without_session_is_rejected() {
        let mut harness = Harness::new();
        harness.session.invalidate();
        let (status, _) = harness.run(0x03, 14, &[]);
        assert_eq!(status, Status::InsufficientAuthentication);
    }

    #[test]
    fn write_updates_the_delegate() {
        let mut harness = Harness::new();
        let body = tlv(&[(param::VALUE, &[1])]);
        let (status, _) = harness.run(0x02, 13, &body);
        assert_eq!(status, Status::Success);
        assert!(harness.delegate.on);
    }

    #[test]
    fn write_out_of_range_is_rejected() {
        let mut harness = Harness::new();
        let body = tlv(&[(param::VALUE, &[101])]);
        let (status, _) = harness.run(0x02, 14, &body);
        assert_eq!(status, Status::InvalidRequest);
        assert_eq!(harness.delegate.writes, 0);
    }

    #[test]
    fn write_with_response_echoes_the_value() {
        let mut harness = Harness::new();
        let body = tlv(&[(param::VALUE, &[1]), (param::RETURN_RESPONSE, &[1])]);
        let (status, response) = harness.run(0x02, 13, &body);
        assert_eq!(status, Status::Success);
        let reader = TlvReader::new(&response);
        assert_eq!(reader.find(param::VALUE).unwrap().parse_u8().unwrap(), 1);
    }

    #[test]
    fn direct_write_to_timed_write_characteristic_is_rejected() {
        let mut harness = Harness::new();
        let body = tlv(&[(param::VALUE, &[1])]);
        let (status, _) = harness.run(0x02, 15, &body);
        assert_eq!(status, Status::InvalidRequest);
    }

    #[test]
    fn timed_write_commits_before_deadline() {
        let mut harness = Harness::new();
        // TTL 5 -> 500ms.
        let body = tlv(&[(param::TTL, &[5]), (param::VALUE, &[7])]);
        let (status, _) = harness.run(0x04, 15, &body);
        assert_eq!(status, Status::Success);
        assert!(harness.timed_write.is_some());

        harness.now = harness.now + Duration::from_millis(400);
        let (status, _) = harness.run(0x05, 15, &[]);
        assert_eq!(status, Status::Success);
        assert_eq!(harness.delegate.writes, 1);
    }

    #[test]
    fn expired_timed_write_is_dropped() {
        let mut harness = Harness::new();
        // TTL 1 -> 100ms; executed 150ms later.
        let body = tlv(&[(param::TTL, &[1]), (param::VALUE, &[7])]);
        let (status, _) = harness.run(0x04, 15, &body);
        assert_eq!(status, Status::Success);

        harness.now = harness.now + Duration::from_millis(150);
        let (status, _) = harness.run(0x05, 15, &[]);
        assert_eq!(status, Status::InvalidRequest);
        assert_eq!(harness.delegate.writes, 0);
        assert!(harness.timed_write.is_none());
    }

    #[test]
    fn execute_without_pending_timed_write() {
        let mut harness = Harness::new();
        let (status, _) = harness.run(0x05, 15, &[]);
        assert_eq!(status, Status::InvalidRequest);
    }

    #[test]
    fn service_signature_read_lists_links() {
        let mut harness = Harness::new();
        let body = harness.tlv_body(0x06, 10, &[]);
        let reader = TlvReader::new(&body);

        let props = reader.find(param::SERVICE_PROPERTIES).unwrap();
        assert_eq!(props.parse_uint_le().unwrap(), 1); // primary

        let linked = reader.find(param::LINKED_SERVICES).unwrap();
        let mut bytes = [0; 2];
        linked.copy_into(&mut bytes).unwrap();
        assert_eq!(u16::from_le_bytes(bytes), 16);
    }

    #[test]
    fn broadcast_configuration_round_trip() {
        let mut harness = Harness::new();

        // S6: enable at 1280 ms.
        let body = tlv(&[
            (config_tlv::PROPERTIES, &1u16.to_le_bytes()),
            (config_tlv::BROADCAST_INTERVAL, &[0x02]),
        ]);
        let response = harness.tlv_body(0x07, 13, &body);
        let reader = TlvReader::new(&response);
        assert_eq!(
            reader.find(config_tlv::PROPERTIES).unwrap().parse_uint_le().unwrap(),
            1
        );
        assert_eq!(
            reader
                .find(config_tlv::BROADCAST_INTERVAL)
                .unwrap()
                .parse_u8()
                .unwrap(),
            0x02
        );

        // Read back without modifying.
        let response = harness.tlv_body(0x07, 13, &[]);
        let reader = TlvReader::new(&response);
        assert_eq!(
            reader.find(config_tlv::PROPERTIES).unwrap().parse_uint_le().unwrap(),
            1
        );

        // Disable, then read back.
        let body = tlv(&[(config_tlv::PROPERTIES, &0u16.to_le_bytes())]);
        let response = harness.tlv_body(0x07, 13, &body);
        let reader = TlvReader::new(&response);
        assert_eq!(
            reader.find(config_tlv::PROPERTIES).unwrap().parse_uint_le().unwrap(),
            0
        );
        assert!(reader.find(config_tlv::BROADCAST_INTERVAL).is_none());
    }

    #[test]
    fn broadcasts_require_support() {
        let mut harness = Harness::new();
        let body = tlv(&[
            (config_tlv::PROPERTIES, &1u16.to_le_bytes()),
            (config_tlv::BROADCAST_INTERVAL, &[0x01]),
        ]);
        let (status, _) = harness.run(0x07, 14, &body);
        assert_eq!(status, Status::InvalidRequest);
    }

    #[test]
    fn protocol_configuration_reports_state() {
        let mut harness = Harness::new();
        let body = tlv(&[(protocol_tlv::GET_ALL, &[])]);
        let response = harness.tlv_body(0x08, 10, &body);
        let reader = TlvReader::new(&response);

        assert_eq!(
            reader
                .find(protocol_tlv::CURRENT_STATE_NUMBER)
                .unwrap()
                .parse_uint_le()
                .unwrap(),
            77
        );
        assert_eq!(
            reader
                .find(protocol_tlv::CURRENT_CONFIG_NUMBER)
                .unwrap()
                .parse_u8()
                .unwrap(),
            3
        );
        assert_eq!(reader.find(protocol_tlv::ADVERTISING_ID).unwrap().len(), 6);
        // No broadcast key generated yet.
        assert!(reader.find(protocol_tlv::BROADCAST_KEY).is_none());
    }

    #[test]
    fn protocol_configuration_generates_broadcast_key() {
        let mut harness = Harness::new();
        let body = tlv(&[(protocol_tlv::GENERATE_BROADCAST_KEY, &[])]);
        let response = harness.tlv_body(0x08, 10, &body);
        let reader = TlvReader::new(&response);
        assert_eq!(reader.find(protocol_tlv::BROADCAST_KEY).unwrap().len(), 32);
        assert!(broadcast::key(&harness.store).unwrap().is_some());
    }

    #[test]
    fn token_opcodes_are_unsupported() {
        let mut harness = Harness::new();
        for opcode in [0x09, 0x0A, 0x0B] {
            let (status, _) = harness.run(opcode, 10, &[]);
            assert_eq!(status, Status::UnsupportedPdu);
        }
    }

    #[test]
    fn transient_sessions_cannot_touch_characteristics() {
        let mut harness = Harness::new();
        harness.session.invalidate();
        harness.session.open_transient(&[1; 64]);
        let (status, _) = harness.run(0x03, 14, &[]);
        assert_eq!(status, Status::InsufficientAuthentication);
    }
}
