//! BACnet/IP Adapter
//!
//! Reads present values with ReadPropertyMultiple (falling back to
//! ReadProperty for devices that reject it), writes through the priority
//! array with WriteProperty, discovers devices with Who-Is and enumerates a
//! device's object list.

pub mod client;
pub mod codec;
mod config;

pub use client::BacnetClient;
pub use codec::CodecError;
pub use config::{BACNET_PORT, BacnetNetConfig, parse_endpoint};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use bms_types::{
    BacnetAddress, Candidate, DataType, DeviceAddress, ObjectType, Point, PointAddress,
    PointTemplate, Priority, Protocol, Value, coerce_binary,
};

use self::client::{Announcement, Reply, RequestPolicy, Target};
use self::codec::{AppValue, ObjectId, PropertyRef, PropertyResult, RemoteStation, property};
use super::{AdapterError, AdapterResult, PointError, ProtocolAdapter, ReadResults};

impl From<CodecError> for AdapterError {
    fn from(err: CodecError) -> Self {
        AdapterError::Transport(format!("malformed response: {}", err))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

pub struct BacnetAdapter {
    config: BacnetNetConfig,
    /// Bound device; `None` for a discovery adapter
    device: Option<BacnetAddress>,
    client: Option<BacnetClient>,
    target: Option<Target>,
    rpm_supported: bool,
}

impl BacnetAdapter {
    pub fn for_device(config: BacnetNetConfig, device: BacnetAddress) -> Self {
        Self {
            config,
            device: Some(device),
            client: None,
            target: None,
            rpm_supported: true,
        }
    }

    pub fn for_discovery(config: BacnetNetConfig) -> Self {
        Self {
            config,
            device: None,
            client: None,
            target: None,
            rpm_supported: true,
        }
    }

    fn bound_device(&self) -> AdapterResult<&BacnetAddress> {
        self.device
            .as_ref()
            .ok_or_else(|| AdapterError::Unsupported("adapter is not bound to a device".into()))
    }

    fn policy(&self) -> AdapterResult<RequestPolicy> {
        let tuning = &self.bound_device()?.tuning;
        Ok(RequestPolicy {
            timeout: Duration::from_millis(tuning.apdu_timeout_ms.max(1)),
            retries: tuning.apdu_retries,
        })
    }

    /// Bind the socket and resolve the device address, both lazily
    async fn connection(&mut self) -> AdapterResult<(&mut BacnetClient, Target)> {
        if self.target.is_none() {
            let target = self.resolve_target().await?;
            tracing::debug!(endpoint = %target.addr, "BACnet device bound");
            self.target = Some(target);
        }
        if self.client.is_none() {
            self.client = Some(BacnetClient::bind_ephemeral(&self.config).await?);
        }
        match (self.client.as_mut(), self.target.clone()) {
            (Some(client), Some(target)) => Ok((client, target)),
            _ => Err(AdapterError::Transport("BACnet client not available".into())),
        }
    }

    async fn resolve_target(&self) -> AdapterResult<Target> {
        let device = self.bound_device()?;
        let route = device.is_routed().then(|| RemoteStation {
            network: device.network,
            mac: device.mac.clone(),
        });
        if let Some(endpoint) = &device.endpoint {
            return Ok(Target {
                addr: parse_endpoint(endpoint)?,
                route,
            });
        }

        // Instance only: locate the device with a targeted Who-Is
        let instance = device.instance;
        let wait = Duration::from_millis(device.tuning.apdu_timeout_ms.max(1));
        let mut listener = BacnetClient::bind_listener(&self.config).await?;
        listener.who_is(Some((instance, instance))).await?;
        let found = listener
            .collect_i_am(Instant::now() + wait, Some(instance))
            .await?;
        found
            .into_iter()
            .find(|a| a.i_am.device.instance == instance)
            .map(|a| Target {
                addr: a.addr,
                route: a.source.or(route),
            })
            .ok_or(AdapterError::Timeout(wait))
    }

    async fn read_property(
        &mut self,
        object: ObjectId,
        prop: PropertyRef,
    ) -> AdapterResult<Vec<AppValue>> {
        let policy = self.policy()?;
        let (client, target) = self.connection().await?;
        let reply = client
            .request(&target, policy, |id| codec::encode_read_property(id, object, prop))
            .await?;
        match reply {
            Reply::Complex(payload) => Ok(codec::decode_read_property_ack(&payload)?.values),
            Reply::Simple => Err(AdapterError::Transport(
                "ReadProperty answered with SimpleACK".into(),
            )),
        }
    }

    async fn read_present_values_rpm(
        &mut self,
        objects: &[ObjectId],
    ) -> AdapterResult<HashMap<ObjectId, Result<Vec<AppValue>, String>>> {
        let policy = self.policy()?;
        let requests: Vec<_> = objects
            .iter()
            .map(|oid| (*oid, vec![PropertyRef::new(property::PRESENT_VALUE)]))
            .collect();
        let (client, target) = self.connection().await?;
        let reply = client
            .request(&target, policy, |id| {
                codec::encode_read_property_multiple(id, &requests)
            })
            .await?;
        let Reply::Complex(payload) = reply else {
            return Err(AdapterError::Transport(
                "ReadPropertyMultiple answered with SimpleACK".into(),
            ));
        };
        Ok(codec::decode_read_property_multiple_ack(&payload)?
            .into_iter()
            .map(|access| {
                let result = match access.result {
                    PropertyResult::Value(values) => Ok(values),
                    PropertyResult::Error { class, code } => {
                        Err(codec::describe_error(class, code))
                    }
                };
                (access.object, result)
            })
            .collect())
    }

    /// Object-list as one array, or index by index when the device cannot
    /// return it unsegmented.
    async fn read_object_list(&mut self, device: ObjectId) -> AdapterResult<Vec<ObjectId>> {
        let whole = self
            .read_property(device, PropertyRef::new(property::OBJECT_LIST))
            .await;
        let values = match whole {
            Ok(values) => values,
            Err(AdapterError::Unsupported(reason)) => {
                tracing::debug!(%device, reason = %reason, "Reading object-list index by index");
                let count = match self
                    .read_property(device, PropertyRef::indexed(property::OBJECT_LIST, 0))
                    .await?
                    .first()
                {
                    Some(AppValue::Unsigned(n)) => *n as u32,
                    other => {
                        return Err(AdapterError::Remote(format!(
                            "object-list length is {:?}",
                            other
                        )));
                    }
                };
                let mut values = Vec::with_capacity(count as usize);
                for index in 1..=count {
                    values.extend(
                        self.read_property(
                            device,
                            PropertyRef::indexed(property::OBJECT_LIST, index),
                        )
                        .await?,
                    );
                }
                values
            }
            Err(e) => return Err(e),
        };

        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                AppValue::ObjectId(oid) => Some(oid),
                _ => None,
            })
            .collect())
    }
}

fn object_of(point: &Point) -> Option<ObjectId> {
    match point.address {
        PointAddress::Bacnet {
            object_type,
            instance,
        } => Some(ObjectId::new(object_type, instance)),
        _ => None,
    }
}

#[async_trait]
impl ProtocolAdapter for BacnetAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Bacnet
    }

    async fn read(&mut self, points: &[Arc<Point>]) -> AdapterResult<ReadResults> {
        let mut results = ReadResults::with_capacity(points.len());
        let mut wanted = Vec::with_capacity(points.len());
        for point in points {
            match object_of(point) {
                Some(oid) => wanted.push((oid, Arc::clone(point))),
                None => {
                    results.insert(point.id, Err(PointError::new("not a BACnet point")));
                }
            }
        }

        let chunk_size = self.bound_device()?.tuning.max_rpm_objects.max(1);
        let mut pending: &[(ObjectId, Arc<Point>)] = &wanted;

        while self.rpm_supported && !pending.is_empty() {
            let take = chunk_size.min(pending.len());
            let (chunk, rest) = pending.split_at(take);
            let objects: Vec<ObjectId> = chunk.iter().map(|(oid, _)| *oid).collect();
            match self.read_present_values_rpm(&objects).await {
                Ok(mut values) => {
                    for (oid, point) in chunk {
                        let result = match values.remove(oid) {
                            Some(Ok(values)) => decode_present_value(&values, point),
                            Some(Err(reason)) => Err(PointError(reason)),
                            None => Err(PointError::new("missing from ReadPropertyMultiple reply")),
                        };
                        results.insert(point.id, result);
                    }
                    pending = rest;
                }
                Err(AdapterError::Remote(reason)) | Err(AdapterError::Unsupported(reason)) => {
                    tracing::info!(reason = %reason, "Device rejected ReadPropertyMultiple, using ReadProperty");
                    self.rpm_supported = false;
                }
                Err(e) => return Err(e),
            }
        }

        for (oid, point) in pending {
            let result = match self
                .read_property(*oid, PropertyRef::new(property::PRESENT_VALUE))
                .await
            {
                Ok(values) => decode_present_value(&values, point),
                Err(AdapterError::Remote(reason)) | Err(AdapterError::Unsupported(reason)) => {
                    Err(PointError(reason))
                }
                Err(e) => return Err(e),
            };
            results.insert(point.id, result);
        }

        Ok(results)
    }

    async fn write(
        &mut self,
        point: &Point,
        value: Option<&Value>,
        priority: Option<Priority>,
    ) -> AdapterResult<()> {
        let oid = object_of(point)
            .ok_or_else(|| AdapterError::Unsupported("not a BACnet point".into()))?;
        let encoded = match value {
            Some(value) => encode_present_value(point, value)?,
            None => AppValue::Null,
        };
        let priority = oid
            .object_type
            .is_commandable()
            .then(|| priority.unwrap_or(Priority::LOWEST).level());

        let policy = self.policy()?;
        let (client, target) = self.connection().await?;
        client
            .request(&target, policy, |id| {
                codec::encode_write_property(
                    id,
                    oid,
                    PropertyRef::new(property::PRESENT_VALUE),
                    &encoded,
                    priority,
                )
            })
            .await?;
        Ok(())
    }

    async fn discover(&mut self, timeout: Duration) -> AdapterResult<Vec<Candidate>> {
        let mut listener = BacnetClient::bind_listener(&self.config).await?;
        tracing::debug!(local = ?listener.local_addr().ok(), "BACnet discovery listening");
        listener.who_is(None).await?;
        let announcements = listener
            .collect_i_am(Instant::now() + timeout, None)
            .await?;
        Ok(announcements.into_iter().map(candidate_from).collect())
    }

    async fn enumerate(&mut self) -> AdapterResult<Vec<PointTemplate>> {
        let device = ObjectId::device(self.bound_device()?.instance);
        let objects = self.read_object_list(device).await?;

        let mut templates = Vec::new();
        for oid in objects {
            if !oid.object_type.has_present_value() {
                continue;
            }
            let name = match self
                .read_property(oid, PropertyRef::new(property::OBJECT_NAME))
                .await
            {
                Ok(values) => match values.first() {
                    Some(AppValue::CharacterString(s)) => s.clone(),
                    _ => oid.to_string(),
                },
                Err(AdapterError::Remote(_)) => oid.to_string(),
                Err(e) => return Err(e),
            };
            templates.push(PointTemplate {
                name,
                address: PointAddress::Bacnet {
                    object_type: oid.object_type,
                    instance: oid.instance,
                },
                data_type: oid.object_type.default_data_type(),
                writable: oid.object_type.is_commandable(),
                units: None,
            });
        }
        Ok(templates)
    }

    async fn close(&mut self) {
        self.client = None;
        if self.device.as_ref().is_some_and(|d| d.endpoint.is_none()) {
            self.target = None;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Mapping
// ─────────────────────────────────────────────────────────────────────────────

fn decode_present_value(values: &[AppValue], point: &Point) -> Result<Value, PointError> {
    let value = values
        .first()
        .ok_or_else(|| PointError::new("empty present-value"))?;
    let decoded = match (value, point.data_type) {
        (AppValue::Boolean(b), _) => Value::Bool(*b),
        (AppValue::Enumerated(n), DataType::Boolean) => Value::Bool(*n != 0),
        (AppValue::Unsigned(n), DataType::Boolean) => Value::Bool(*n != 0),
        (AppValue::Real(r), _) => Value::Number(f64::from(*r)),
        (AppValue::Double(d), _) => Value::Number(*d),
        (AppValue::Unsigned(n), _) => Value::Number(*n as f64),
        (AppValue::Signed(n), _) => Value::Number(*n as f64),
        (AppValue::Enumerated(n), _) => Value::Number(f64::from(*n)),
        (AppValue::CharacterString(s), _) => Value::Text(s.clone()),
        (AppValue::Null, _) => return Err(PointError::new("present-value is null")),
        (other, _) => {
            return Err(PointError(format!(
                "unsupported present-value type {:?}",
                other
            )));
        }
    };
    Ok(decoded)
}

fn encode_present_value(point: &Point, value: &Value) -> AdapterResult<AppValue> {
    let PointAddress::Bacnet { object_type, .. } = point.address else {
        return Err(AdapterError::Unsupported("not a BACnet point".into()));
    };
    let number = || {
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| AdapterError::Unsupported(format!("{} is not numeric", value)))
    };
    Ok(match object_type {
        ObjectType::BinaryOutput | ObjectType::BinaryValue | ObjectType::BinaryInput => {
            AppValue::Enumerated(u32::from(coerce_binary(value)))
        }
        ObjectType::MultiStateOutput | ObjectType::MultiStateValue | ObjectType::MultiStateInput => {
            AppValue::Unsigned(u64::from(integral::<u32>(number()?)?))
        }
        ObjectType::LargeAnalogValue => AppValue::Double(number()?),
        ObjectType::IntegerValue => AppValue::Signed(i64::from(integral::<i32>(number()?)?)),
        ObjectType::PositiveIntegerValue => {
            AppValue::Unsigned(u64::from(integral::<u32>(number()?)?))
        }
        ObjectType::CharacterStringValue => AppValue::CharacterString(raw_text(value)),
        _ => match point.data_type {
            DataType::Boolean => AppValue::Enumerated(u32::from(coerce_binary(value))),
            DataType::Text => AppValue::CharacterString(raw_text(value)),
            _ => AppValue::Real(number()? as f32),
        },
    })
}

/// Round to the nearest integer, rejecting values the target type cannot hold
fn integral<T: TryFrom<i64>>(n: f64) -> AdapterResult<T> {
    let rounded = n.round();
    let out_of_range = || AdapterError::Unsupported(format!("{} is out of range", n));
    if !rounded.is_finite() || rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    T::try_from(rounded as i64).map_err(|_| out_of_range())
}

/// Text without the quoting `Display` adds
fn raw_text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
    }
}

fn candidate_from(announcement: Announcement) -> Candidate {
    let Announcement { i_am, addr, source } = announcement;
    let mut address = BacnetAddress::new(i_am.device.instance).with_endpoint(addr.to_string());
    if let Some(station) = source {
        address.network = station.network;
        address.mac = station.mac;
    }
    let mut candidate = Candidate::new(DeviceAddress::Bacnet(address));
    candidate.vendor_id = Some(i_am.vendor_id);
    candidate.max_apdu = Some(i_am.max_apdu);
    candidate.segmentation = Some(i_am.segmentation);
    candidate
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::codec::*;
    use super::*;
    use bytes::BytesMut;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    /// Loopback BACnet device answering Who-Is, ReadProperty,
    /// ReadPropertyMultiple and WriteProperty from a fixed object table.
    pub(crate) struct FakeDevice {
        pub addr: SocketAddr,
        pub writes: Arc<parking_lot::Mutex<Vec<(ObjectId, AppValue, Option<u8>)>>>,
        pub requests: Arc<AtomicUsize>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    #[derive(Clone)]
    pub(crate) struct FakeBehavior {
        pub instance: u32,
        pub objects: Vec<(ObjectId, String, AppValue)>,
        pub reject_rpm: bool,
        /// Abort whole object-list reads as if they needed segmentation
        pub segment_object_list: bool,
        /// I-Am replies sent per Who-Is, as seen through redundant paths
        pub i_am_copies: usize,
    }

    impl FakeDevice {
        pub async fn spawn(behavior: FakeBehavior) -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            let writes = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let requests = Arc::new(AtomicUsize::new(0));
            let task = tokio::spawn(serve(
                socket,
                behavior,
                Arc::clone(&writes),
                Arc::clone(&requests),
            ));
            Self {
                addr,
                writes,
                requests,
                task,
            }
        }
    }

    async fn serve(
        socket: UdpSocket,
        mut behavior: FakeBehavior,
        writes: Arc<parking_lot::Mutex<Vec<(ObjectId, AppValue, Option<u8>)>>>,
        requests: Arc<AtomicUsize>,
    ) {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(Some(frame)) = decode_frame(&buf[..len]) else {
                continue;
            };
            let mut copies = 1;
            let reply = match decode_apdu(frame.apdu) {
                Ok(Apdu::UnconfirmedRequest {
                    service: service::WHO_IS,
                    payload,
                }) => {
                    copies = behavior.i_am_copies.max(1);
                    let range = decode_who_is(payload).unwrap();
                    let in_range = range
                        .is_none_or(|(lo, hi)| (lo..=hi).contains(&behavior.instance));
                    in_range.then(|| {
                        encode_i_am(&IAm {
                            device: ObjectId::device(behavior.instance),
                            max_apdu: 1476,
                            segmentation: 3,
                            vendor_id: 999,
                        })
                    })
                }
                Ok(Apdu::ConfirmedRequest {
                    invoke_id,
                    service,
                    payload,
                }) => {
                    requests.fetch_add(1, Ordering::SeqCst);
                    Some(answer(&mut behavior, &writes, invoke_id, service, payload))
                }
                _ => None,
            };
            if let Some(apdu) = reply {
                let frame = encode_frame(&apdu, None, false, false);
                for _ in 0..copies {
                    let _ = socket.send_to(&frame, src).await;
                }
            }
        }
    }

    fn lookup(behavior: &FakeBehavior, oid: ObjectId, prop: PropertyRef) -> Result<Vec<AppValue>, (u32, u32)> {
        let device = ObjectId::device(behavior.instance);
        if oid == device && prop.property == property::OBJECT_LIST {
            let list: Vec<AppValue> = std::iter::once(device)
                .chain(behavior.objects.iter().map(|(o, _, _)| *o))
                .map(AppValue::ObjectId)
                .collect();
            return match prop.index {
                None => Ok(list),
                Some(0) => Ok(vec![AppValue::Unsigned(list.len() as u64)]),
                Some(i) => list
                    .get(i as usize - 1)
                    .cloned()
                    .map(|v| vec![v])
                    .ok_or((2, 42)),
            };
        }
        let (_, name, value) = behavior
            .objects
            .iter()
            .find(|(o, _, _)| *o == oid)
            .ok_or((1, 31))?;
        match prop.property {
            property::PRESENT_VALUE => Ok(vec![value.clone()]),
            property::OBJECT_NAME => Ok(vec![AppValue::CharacterString(name.clone())]),
            _ => Err((2, 32)),
        }
    }

    fn answer(
        behavior: &mut FakeBehavior,
        writes: &parking_lot::Mutex<Vec<(ObjectId, AppValue, Option<u8>)>>,
        invoke_id: u8,
        service_choice: u8,
        payload: &[u8],
    ) -> BytesMut {
        let mut out = BytesMut::new();
        let error = |out: &mut BytesMut, (class, code): (u32, u32)| {
            out.extend_from_slice(&[pdu_type::ERROR, invoke_id, service_choice]);
            put_app_value(out, &AppValue::Enumerated(class));
            put_app_value(out, &AppValue::Enumerated(code));
        };
        let mut reader = TagReader::new(payload);
        match service_choice {
            service::READ_PROPERTY => {
                let oid = reader.context_object_id(0).unwrap();
                let property = reader.context_unsigned(1).unwrap() as u32;
                let index = reader
                    .next_is_context(2)
                    .then(|| reader.context_unsigned(2).unwrap() as u32);
                let prop = PropertyRef { property, index };
                if behavior.segment_object_list
                    && property == property::OBJECT_LIST
                    && index.is_none()
                {
                    out.extend_from_slice(&[pdu_type::ABORT | 0x01, invoke_id, 4]);
                    return out;
                }
                match lookup(behavior, oid, prop) {
                    Ok(values) => {
                        out.extend_from_slice(&[pdu_type::COMPLEX_ACK, invoke_id, service_choice]);
                        put_context_object_id(&mut out, 0, oid);
                        put_context_unsigned(&mut out, 1, u64::from(property));
                        if let Some(i) = index {
                            put_context_unsigned(&mut out, 2, u64::from(i));
                        }
                        put_opening(&mut out, 3);
                        for v in &values {
                            put_app_value(&mut out, v);
                        }
                        put_closing(&mut out, 3);
                    }
                    Err(code) => error(&mut out, code),
                }
            }
            service::READ_PROPERTY_MULTIPLE if behavior.reject_rpm => {
                out.extend_from_slice(&[pdu_type::REJECT, invoke_id, 9]);
            }
            service::READ_PROPERTY_MULTIPLE => {
                out.extend_from_slice(&[pdu_type::COMPLEX_ACK, invoke_id, service_choice]);
                while !reader.is_empty() {
                    let oid = reader.context_object_id(0).unwrap();
                    reader.expect_opening(1).unwrap();
                    put_context_object_id(&mut out, 0, oid);
                    put_opening(&mut out, 1);
                    while !reader.next_is_closing(1) {
                        let property = reader.context_unsigned(0).unwrap() as u32;
                        put_context_unsigned(&mut out, 2, u64::from(property));
                        match lookup(behavior, oid, PropertyRef::new(property)) {
                            Ok(values) => {
                                put_opening(&mut out, 4);
                                for v in &values {
                                    put_app_value(&mut out, v);
                                }
                                put_closing(&mut out, 4);
                            }
                            Err((class, code)) => {
                                put_opening(&mut out, 5);
                                put_app_value(&mut out, &AppValue::Enumerated(class));
                                put_app_value(&mut out, &AppValue::Enumerated(code));
                                put_closing(&mut out, 5);
                            }
                        }
                    }
                    reader.expect_closing(1).unwrap();
                    put_closing(&mut out, 1);
                }
            }
            service::WRITE_PROPERTY => {
                let oid = reader.context_object_id(0).unwrap();
                let _property = reader.context_unsigned(1).unwrap();
                reader.expect_opening(3).unwrap();
                let value = reader.values_until_closing(3).unwrap().remove(0);
                let priority = reader
                    .next_is_context(4)
                    .then(|| reader.context_unsigned(4).unwrap() as u8);
                writes.lock().push((oid, value.clone(), priority));
                match behavior.objects.iter_mut().find(|(o, _, _)| *o == oid) {
                    Some(entry) => {
                        if value != AppValue::Null {
                            entry.2 = value;
                        }
                        out.extend_from_slice(&[pdu_type::SIMPLE_ACK, invoke_id, service_choice]);
                    }
                    None => error(&mut out, (1, 31)),
                }
            }
            _ => {
                out.extend_from_slice(&[pdu_type::REJECT, invoke_id, 9]);
            }
        }
        out
    }

    pub(crate) fn loopback_config() -> BacnetNetConfig {
        BacnetNetConfig {
            interface: "127.0.0.1".into(),
            port: 0,
            broadcast: None,
        }
    }

    pub(crate) fn sample_behavior() -> FakeBehavior {
        FakeBehavior {
            instance: 1001,
            objects: vec![
                (
                    ObjectId::new(ObjectType::AnalogInput, 1),
                    "Zone Temp".into(),
                    AppValue::Real(21.5),
                ),
                (
                    ObjectId::new(ObjectType::AnalogOutput, 2),
                    "Damper Cmd".into(),
                    AppValue::Real(40.0),
                ),
                (
                    ObjectId::new(ObjectType::BinaryValue, 3),
                    "Occupied".into(),
                    AppValue::Enumerated(1),
                ),
            ],
            reject_rpm: false,
            segment_object_list: false,
            i_am_copies: 1,
        }
    }

    fn tuned(instance: u32, endpoint: Option<SocketAddr>) -> BacnetAddress {
        let mut address = BacnetAddress::new(instance);
        address.endpoint = endpoint.map(|e| e.to_string());
        address.tuning.apdu_timeout_ms = 200;
        address.tuning.apdu_retries = 1;
        address
    }

    fn points() -> Vec<Arc<Point>> {
        vec![
            Arc::new(Point::bacnet(1, 1, ObjectType::AnalogInput, 1)),
            Arc::new(Point::bacnet(2, 1, ObjectType::AnalogOutput, 2).writable()),
            Arc::new(Point::bacnet(3, 1, ObjectType::BinaryValue, 3)),
            Arc::new(Point::bacnet(4, 1, ObjectType::AnalogValue, 99)),
        ]
    }

    #[tokio::test]
    async fn test_read_batches_with_rpm_and_reports_point_errors() {
        let device = FakeDevice::spawn(sample_behavior()).await;
        let mut adapter =
            BacnetAdapter::for_device(loopback_config(), tuned(1001, Some(device.addr)));

        let results = adapter.read(&points()).await.unwrap();
        assert_eq!(results[&1], Ok(Value::Number(21.5)));
        assert_eq!(results[&2], Ok(Value::Number(40.0)));
        assert_eq!(results[&3], Ok(Value::Bool(true)));
        assert_eq!(results[&4], Err(PointError::new("object:unknown-object")));
        // One RPM request for all four objects
        assert_eq!(device.requests.load(Ordering::SeqCst), 1);
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_read_falls_back_to_read_property() {
        let mut behavior = sample_behavior();
        behavior.reject_rpm = true;
        let device = FakeDevice::spawn(behavior).await;
        let mut adapter =
            BacnetAdapter::for_device(loopback_config(), tuned(1001, Some(device.addr)));

        let results = adapter.read(&points()).await.unwrap();
        assert_eq!(results[&1], Ok(Value::Number(21.5)));
        assert!(results[&4].is_err());
        // Rejected RPM + four ReadProperty requests
        assert_eq!(device.requests.load(Ordering::SeqCst), 5);

        // Subsequent reads go straight to ReadProperty
        adapter.read(&points()[..1]).await.unwrap();
        assert_eq!(device.requests.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_write_with_priority_and_relinquish() {
        let device = FakeDevice::spawn(sample_behavior()).await;
        let mut adapter =
            BacnetAdapter::for_device(loopback_config(), tuned(1001, Some(device.addr)));
        let ao = Point::bacnet(2, 1, ObjectType::AnalogOutput, 2).writable();

        adapter
            .write(&ao, Some(&Value::Number(42.0)), Some(Priority::new(8).unwrap()))
            .await
            .unwrap();
        adapter
            .write(&ao, None, Some(Priority::new(8).unwrap()))
            .await
            .unwrap();

        let writes = device.writes.lock().clone();
        assert_eq!(
            writes,
            vec![
                (ObjectId::new(ObjectType::AnalogOutput, 2), AppValue::Real(42.0), Some(8)),
                (ObjectId::new(ObjectType::AnalogOutput, 2), AppValue::Null, Some(8)),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_object_write_is_remote_error() {
        let device = FakeDevice::spawn(sample_behavior()).await;
        let mut adapter =
            BacnetAdapter::for_device(loopback_config(), tuned(1001, Some(device.addr)));
        let missing = Point::bacnet(9, 1, ObjectType::AnalogValue, 77).writable();
        let result = adapter.write(&missing, Some(&Value::Number(1.0)), None).await;
        assert!(matches!(result, Err(AdapterError::Remote(_))));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut address = tuned(1001, Some(silent.local_addr().unwrap()));
        address.tuning.apdu_timeout_ms = 30;
        address.tuning.apdu_retries = 0;
        let mut adapter = BacnetAdapter::for_device(loopback_config(), address);
        let result = adapter.read(&points()[..1]).await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_discovery_collects_i_am() {
        let device = FakeDevice::spawn(sample_behavior()).await;
        let mut config = loopback_config();
        config.broadcast = Some(device.addr.to_string());
        let mut adapter = BacnetAdapter::for_discovery(config);

        let candidates = adapter.discover(Duration::from_millis(200)).await.unwrap();
        assert_eq!(candidates.len(), 1);
        let DeviceAddress::Bacnet(address) = &candidates[0].address else {
            panic!("expected BACnet candidate");
        };
        assert_eq!(address.instance, 1001);
        assert_eq!(address.endpoint.as_deref(), Some(device.addr.to_string().as_str()));
        assert_eq!(candidates[0].vendor_id, Some(999));
    }

    #[test]
    fn test_text_and_integer_present_values() {
        let text = Point::bacnet(5, 1, ObjectType::CharacterStringValue, 1).writable();
        assert_eq!(
            encode_present_value(&text, &Value::Text("AB".into())),
            Ok(AppValue::CharacterString("AB".into()))
        );

        let integer = Point::bacnet(6, 1, ObjectType::IntegerValue, 1).writable();
        assert_eq!(
            encode_present_value(&integer, &Value::Number(-5.0)),
            Ok(AppValue::Signed(-5))
        );
        assert!(matches!(
            encode_present_value(&integer, &Value::Number(1e12)),
            Err(AdapterError::Unsupported(_))
        ));

        let positive = Point::bacnet(7, 1, ObjectType::PositiveIntegerValue, 1).writable();
        assert!(matches!(
            encode_present_value(&positive, &Value::Number(-1.0)),
            Err(AdapterError::Unsupported(_))
        ));

        let multistate = Point::bacnet(8, 1, ObjectType::MultiStateValue, 1).writable();
        assert_eq!(
            encode_present_value(&multistate, &Value::Number(3.0)),
            Ok(AppValue::Unsigned(3))
        );
        assert!(matches!(
            encode_present_value(&multistate, &Value::Number(f64::from(u32::MAX) + 1.0)),
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[test]
    fn test_binary_objects_follow_active_rule() {
        let bv = Point::bacnet(3, 1, ObjectType::BinaryValue, 3).writable();
        assert_eq!(
            encode_present_value(&bv, &Value::Text("Active".into())),
            Ok(AppValue::Enumerated(1))
        );
        assert_eq!(
            encode_present_value(&bv, &Value::Text("on".into())),
            Ok(AppValue::Enumerated(0))
        );
    }

    #[tokio::test]
    async fn test_instance_only_device_is_bound_with_who_is() {
        let device = FakeDevice::spawn(sample_behavior()).await;
        let mut config = loopback_config();
        config.broadcast = Some(device.addr.to_string());
        let mut adapter = BacnetAdapter::for_device(config, tuned(1001, None));

        let results = adapter.read(&points()[..1]).await.unwrap();
        assert_eq!(results[&1], Ok(Value::Number(21.5)));
    }

    #[tokio::test]
    async fn test_enumerate_falls_back_to_indexed_object_list() {
        let mut behavior = sample_behavior();
        behavior.segment_object_list = true;
        let device = FakeDevice::spawn(behavior).await;
        let mut adapter =
            BacnetAdapter::for_device(loopback_config(), tuned(1001, Some(device.addr)));

        let templates = adapter.enumerate().await.unwrap();
        let names: Vec<_> = templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Zone Temp", "Damper Cmd", "Occupied"]);
        assert!(!templates[0].writable);
        assert!(templates[1].writable);
        assert_eq!(templates[2].data_type, DataType::Boolean);
    }
}
