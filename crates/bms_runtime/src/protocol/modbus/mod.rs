//! Modbus TCP/RTU Adapter
//!
//! Reads are planned into coalesced range requests per register table.
//! Writes use single-coil, single-register or multiple-register requests
//! depending on the point's width. Every request is bounded by the device's
//! response timeout.

pub mod codec;
pub mod planner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_modbus::Exception as ExceptionCode;
use tokio_serial::SerialPortBuilderExt;
use tokio_modbus::client::{Client as _, Context, Reader, Writer, rtu, tcp};
use tokio_modbus::slave::{Slave, SlaveContext as _};

use bms_types::{
    Candidate, DeviceAddress, ModbusAddress, ModbusTransport, ModbusTuning, Parity, Point,
    PointAddress, Priority, Protocol, RegisterKind, Value, coerce_binary,
};

use self::planner::{PlannerConfig, ReadBatch};
use super::{AdapterError, AdapterResult, PointError, ProtocolAdapter, ReadResults};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Targets swept by Modbus discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusProbeConfig {
    /// Endpoints to probe (TCP hosts or serial lines)
    #[serde(default)]
    pub targets: Vec<ModbusTransport>,
    /// Unit ids tried on every target
    #[serde(default = "default_unit_ids")]
    pub unit_ids: Vec<u8>,
    /// Per-probe response timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_unit_ids() -> Vec<u8> {
    vec![1]
}

fn default_probe_timeout_ms() -> u64 {
    500
}

impl Default for ModbusProbeConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            unit_ids: default_unit_ids(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Request {
    Read {
        kind: RegisterKind,
        start: u16,
        quantity: u16,
    },
    WriteCoil(u16, bool),
    WriteRegister(u16, u16),
    WriteRegisters(u16, Vec<u16>),
}

#[derive(Debug)]
enum Response {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Done,
}

type WireResult = Result<Result<Response, ExceptionCode>, tokio_modbus::Error>;

async fn execute(ctx: &mut Context, request: &Request) -> WireResult {
    Ok(match request {
        Request::Read {
            kind: RegisterKind::Coil,
            start,
            quantity,
        } => ctx.read_coils(*start, *quantity).await?.map(Response::Bits),
        Request::Read {
            kind: RegisterKind::DiscreteInput,
            start,
            quantity,
        } => ctx
            .read_discrete_inputs(*start, *quantity)
            .await?
            .map(Response::Bits),
        Request::Read {
            kind: RegisterKind::HoldingRegister,
            start,
            quantity,
        } => ctx
            .read_holding_registers(*start, *quantity)
            .await?
            .map(Response::Words),
        Request::Read {
            kind: RegisterKind::InputRegister,
            start,
            quantity,
        } => ctx
            .read_input_registers(*start, *quantity)
            .await?
            .map(Response::Words),
        Request::WriteCoil(address, on) => {
            ctx.write_single_coil(*address, *on).await?.map(|_| Response::Done)
        }
        Request::WriteRegister(address, word) => ctx
            .write_single_register(*address, *word)
            .await?
            .map(|_| Response::Done),
        Request::WriteRegisters(address, words) => ctx
            .write_multiple_registers(*address, words)
            .await?
            .map(|_| Response::Done),
    })
}

async fn connect(transport: &ModbusTransport) -> AdapterResult<Context> {
    match transport {
        ModbusTransport::Tcp { host, port } => {
            let addr = tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| AdapterError::Transport(format!("cannot resolve {}", host)))?;
            Ok(tcp::connect(addr).await?)
        }
        ModbusTransport::Rtu {
            path,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => {
            let data_bits = match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };
            let stop_bits = match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };
            let parity = match parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Odd => tokio_serial::Parity::Odd,
                Parity::Even => tokio_serial::Parity::Even,
            };
            let stream = tokio_serial::new(path, *baud_rate)
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .parity(parity)
                .open_native_async()
                .map_err(|e| {
                    AdapterError::Transport(format!("failed to open serial port {}: {}", path, e))
                })?;
            Ok(rtu::attach(stream))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

enum Binding {
    Device {
        transport: ModbusTransport,
        unit_id: u8,
        tuning: ModbusTuning,
    },
    Discovery(ModbusProbeConfig),
}

pub struct ModbusAdapter {
    binding: Binding,
    ctx: Option<Context>,
}

impl ModbusAdapter {
    pub fn for_device(transport: ModbusTransport, unit_id: u8, tuning: ModbusTuning) -> Self {
        Self {
            binding: Binding::Device {
                transport,
                unit_id,
                tuning,
            },
            ctx: None,
        }
    }

    pub fn for_discovery(probe: ModbusProbeConfig) -> Self {
        Self {
            binding: Binding::Discovery(probe),
            ctx: None,
        }
    }

    fn device(&self) -> AdapterResult<(&ModbusTransport, u8, &ModbusTuning)> {
        match &self.binding {
            Binding::Device {
                transport,
                unit_id,
                tuning,
            } => Ok((transport, *unit_id, tuning)),
            Binding::Discovery(_) => Err(AdapterError::Unsupported(
                "adapter is not bound to a device".into(),
            )),
        }
    }

    /// Run one request against the bound device
    ///
    /// Exceptions come back as `Ok(Err(code))`. Timeouts and transport errors
    /// drop the connection so the next call reconnects.
    async fn call(&mut self, request: Request) -> AdapterResult<Result<Response, ExceptionCode>> {
        let (transport, unit_id, tuning) = self.device()?;
        let response_timeout = Duration::from_millis(tuning.response_timeout_ms.max(1));
        let transport = transport.clone();

        if self.ctx.is_none() {
            let ctx = tokio::time::timeout(response_timeout, connect(&transport))
                .await
                .map_err(|_| AdapterError::Timeout(response_timeout))??;
            tracing::debug!(%transport, unit_id, "Modbus connected");
            self.ctx = Some(ctx);
        }
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| AdapterError::Transport("modbus context unavailable".into()))?;
        ctx.set_slave(Slave(unit_id));

        match tokio::time::timeout(response_timeout, execute(ctx, &request)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.ctx = None;
                Err(AdapterError::Transport(e.to_string()))
            }
            Err(_) => {
                self.ctx = None;
                Err(AdapterError::Timeout(response_timeout))
            }
        }
    }

    async fn read_batch(&mut self, batch: &ReadBatch, results: &mut ReadResults) -> AdapterResult<()> {
        let (_, _, tuning) = self.device()?;
        let (byte_order, word_order) = (tuning.byte_order, tuning.word_order);

        let response = self
            .call(Request::Read {
                kind: batch.kind,
                start: batch.start,
                quantity: batch.quantity,
            })
            .await?;

        for point in &batch.points {
            let PointAddress::Modbus { address, .. } = point.address else {
                continue;
            };
            let offset = batch.offset_of(address);
            let result = match &response {
                Err(code) => Err(PointError(format!("modbus exception {:?}", code))),
                Ok(Response::Bits(bits)) => bits
                    .get(offset)
                    .map(|b| Value::Bool(*b))
                    .ok_or_else(|| PointError::new("bit missing from response")),
                Ok(Response::Words(words)) => match words.get(offset..) {
                    Some(slice) => codec::decode_registers(slice, point, byte_order, word_order),
                    None => Err(PointError::new("register missing from response")),
                },
                Ok(Response::Done) => Err(PointError::new("unexpected write response")),
            };
            results.insert(point.id, result);
        }
        Ok(())
    }

    async fn probe(
        &mut self,
        transport: &ModbusTransport,
        unit_ids: &[u8],
        probe_timeout: Duration,
        deadline: Instant,
    ) -> Vec<Candidate> {
        let mut found = Vec::new();
        let connect_by = deadline.min(Instant::now() + probe_timeout);
        let mut ctx = match tokio::time::timeout_at(connect_by, connect(transport)).await {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => {
                tracing::debug!(%transport, error = %e, "Modbus probe target unreachable");
                return found;
            }
            Err(_) => return found,
        };

        for unit_id in unit_ids {
            let probe_by = deadline.min(Instant::now() + probe_timeout);
            if Instant::now() >= deadline {
                break;
            }
            ctx.set_slave(Slave(*unit_id));
            let request = Request::Read {
                kind: RegisterKind::HoldingRegister,
                start: 0,
                quantity: 1,
            };
            // Any reply, including an exception, proves the unit exists
            match tokio::time::timeout_at(probe_by, execute(&mut ctx, &request)).await {
                Ok(Ok(_)) => {
                    let address = ModbusAddress::new(*unit_id).with_transport(transport.clone());
                    found.push(Candidate::new(DeviceAddress::Modbus(address)));
                }
                Ok(Err(e)) => {
                    tracing::debug!(%transport, unit_id, error = %e, "Modbus probe failed");
                    break;
                }
                Err(_) => {
                    // A timed-out request can leave a late reply on the stream
                    let _ = ctx.disconnect().await;
                    match tokio::time::timeout_at(deadline, connect(transport)).await {
                        Ok(Ok(fresh)) => ctx = fresh,
                        _ => return found,
                    }
                }
            }
        }
        let _ = ctx.disconnect().await;
        found
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }

    async fn read(&mut self, points: &[Arc<Point>]) -> AdapterResult<ReadResults> {
        let (_, _, tuning) = self.device()?;
        let config = PlannerConfig {
            max_gap: tuning.max_gap,
            max_span: tuning.max_span,
        };

        let mut results = ReadResults::with_capacity(points.len());
        for point in points {
            if !matches!(point.address, PointAddress::Modbus { .. }) {
                results.insert(point.id, Err(PointError::new("not a Modbus point")));
            }
        }
        for batch in planner::plan_reads(config, points) {
            self.read_batch(&batch, &mut results).await?;
        }
        Ok(results)
    }

    async fn write(
        &mut self,
        point: &Point,
        value: Option<&Value>,
        _priority: Option<Priority>,
    ) -> AdapterResult<()> {
        let value = value.ok_or_else(|| {
            AdapterError::Unsupported("modbus has no relinquish".into())
        })?;
        let PointAddress::Modbus { register, address } = point.address else {
            return Err(AdapterError::Unsupported("not a Modbus point".into()));
        };
        let (_, _, tuning) = self.device()?;
        let request = match register {
            RegisterKind::Coil => Request::WriteCoil(address, coerce_binary(value)),
            RegisterKind::HoldingRegister => {
                let mut words =
                    codec::encode_registers(value, point, tuning.byte_order, tuning.word_order)?;
                if words.len() == 1 {
                    Request::WriteRegister(address, words.remove(0))
                } else {
                    Request::WriteRegisters(address, words)
                }
            }
            other => {
                return Err(AdapterError::Unsupported(format!(
                    "{} is read-only",
                    other
                )));
            }
        };

        match self.call(request).await? {
            Ok(_) => Ok(()),
            Err(code) => Err(AdapterError::Remote(format!("modbus exception {:?}", code))),
        }
    }

    async fn discover(&mut self, timeout: Duration) -> AdapterResult<Vec<Candidate>> {
        let Binding::Discovery(probe) = &self.binding else {
            return Err(AdapterError::Unsupported(
                "discovery needs a discovery adapter".into(),
            ));
        };
        let probe = probe.clone();
        let deadline = Instant::now() + timeout;
        let probe_timeout = Duration::from_millis(probe.probe_timeout_ms.max(1));

        let mut candidates = Vec::new();
        for target in &probe.targets {
            if Instant::now() >= deadline {
                break;
            }
            candidates.extend(
                self.probe(target, &probe.unit_ids, probe_timeout, deadline)
                    .await,
            );
        }
        Ok(candidates)
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bms_types::DataType;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal Modbus TCP slave backed by a register map
    struct FakeSlave {
        addr: SocketAddr,
        registers: Arc<parking_lot::Mutex<HashMap<u16, u16>>>,
        coils: Arc<parking_lot::Mutex<HashMap<u16, bool>>>,
        requests: Arc<AtomicUsize>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Drop for FakeSlave {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    impl FakeSlave {
        async fn spawn(unit_id: u8) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let registers = Arc::new(parking_lot::Mutex::new(HashMap::new()));
            let coils = Arc::new(parking_lot::Mutex::new(HashMap::new()));
            let requests = Arc::new(AtomicUsize::new(0));
            let (r, c, n) = (registers.clone(), coils.clone(), requests.clone());
            let task = tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, unit_id, r.clone(), c.clone(), n.clone()));
                }
            });
            Self {
                addr,
                registers,
                coils,
                requests,
                task,
            }
        }

        fn transport(&self) -> ModbusTransport {
            ModbusTransport::tcp(self.addr.ip().to_string(), self.addr.port())
        }
    }

    async fn serve(
        mut stream: TcpStream,
        unit_id: u8,
        registers: Arc<parking_lot::Mutex<HashMap<u16, u16>>>,
        coils: Arc<parking_lot::Mutex<HashMap<u16, bool>>>,
        requests: Arc<AtomicUsize>,
    ) {
        loop {
            let mut header = [0u8; 7];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let len = usize::from(u16::from_be_bytes([header[4], header[5]])) - 1;
            let mut pdu = vec![0u8; len];
            if stream.read_exact(&mut pdu).await.is_err() {
                return;
            }
            requests.fetch_add(1, Ordering::SeqCst);
            if header[6] != unit_id {
                // Unknown unit: stay silent like a gateway with no route
                continue;
            }
            let word = |i: usize| u16::from_be_bytes([pdu[i], pdu[i + 1]]);
            let function = pdu[0];
            let reply: Vec<u8> = match function {
                0x03 | 0x04 => {
                    let (start, qty) = (word(1), word(3));
                    if start >= 1000 {
                        vec![function | 0x80, 0x02]
                    } else {
                        let regs = registers.lock();
                        let mut out = vec![function, (qty * 2) as u8];
                        for a in start..start + qty {
                            out.extend_from_slice(&regs.get(&a).copied().unwrap_or(0).to_be_bytes());
                        }
                        out
                    }
                }
                0x01 | 0x02 => {
                    let (start, qty) = (word(1), word(3));
                    let bits = coils.lock();
                    let mut packed = vec![0u8; usize::from(qty).div_ceil(8)];
                    for i in 0..qty {
                        if bits.get(&(start + i)).copied().unwrap_or(false) {
                            packed[usize::from(i / 8)] |= 1 << (i % 8);
                        }
                    }
                    let mut out = vec![function, packed.len() as u8];
                    out.extend(packed);
                    out
                }
                0x05 => {
                    coils.lock().insert(word(1), word(3) == 0xFF00);
                    pdu.clone()
                }
                0x06 => {
                    registers.lock().insert(word(1), word(3));
                    pdu.clone()
                }
                0x10 => {
                    let (start, qty) = (word(1), word(3));
                    let mut regs = registers.lock();
                    for i in 0..qty {
                        regs.insert(start + i, word(6 + usize::from(i) * 2));
                    }
                    pdu[..5].to_vec()
                }
                _ => vec![function | 0x80, 0x01],
            };
            let mut frame = header[..4].to_vec();
            frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
            frame.push(unit_id);
            frame.extend(reply);
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    fn tuning() -> ModbusTuning {
        ModbusTuning {
            response_timeout_ms: 300,
            ..ModbusTuning::default()
        }
    }

    #[tokio::test]
    async fn test_read_coalesces_and_decodes() {
        let slave = FakeSlave::spawn(1).await;
        {
            let mut regs = slave.registers.lock();
            regs.insert(100, 215);
            regs.insert(102, 0x41AC);
            regs.insert(103, 0x0000);
        }
        slave.coils.lock().insert(3, true);

        let points = vec![
            Arc::new(
                Point::modbus(1, 1, RegisterKind::HoldingRegister, 100, DataType::Int16)
                    .with_scale(0.1),
            ),
            Arc::new(Point::modbus(2, 1, RegisterKind::HoldingRegister, 102, DataType::Float32)),
            Arc::new(Point::modbus(3, 1, RegisterKind::Coil, 3, DataType::Boolean)),
        ];
        let mut adapter = ModbusAdapter::for_device(slave.transport(), 1, tuning());
        let results = adapter.read(&points).await.unwrap();

        assert_eq!(results[&1], Ok(Value::Number(215.0 * 0.1)));
        assert_eq!(results[&2], Ok(Value::Number(21.5)));
        assert_eq!(results[&3], Ok(Value::Bool(true)));
        // One holding-register batch plus one coil batch
        assert_eq!(slave.requests.load(Ordering::SeqCst), 2);
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_exception_becomes_point_error() {
        let slave = FakeSlave::spawn(1).await;
        let points = vec![Arc::new(Point::modbus(
            1,
            1,
            RegisterKind::HoldingRegister,
            2000,
            DataType::UInt16,
        ))];
        let mut adapter = ModbusAdapter::for_device(slave.transport(), 1, tuning());
        let results = adapter.read(&points).await.unwrap();
        assert!(results[&1].is_err());
    }

    #[tokio::test]
    async fn test_writes_pick_function_by_width() {
        let slave = FakeSlave::spawn(1).await;
        let mut adapter = ModbusAdapter::for_device(slave.transport(), 1, tuning());

        let setpoint = Point::modbus(1, 1, RegisterKind::HoldingRegister, 10, DataType::UInt16);
        adapter
            .write(&setpoint, Some(&Value::Number(42.0)), None)
            .await
            .unwrap();
        let wide = Point::modbus(2, 1, RegisterKind::HoldingRegister, 20, DataType::Float32);
        adapter
            .write(&wide, Some(&Value::Number(21.5)), None)
            .await
            .unwrap();
        let coil = Point::modbus(3, 1, RegisterKind::Coil, 5, DataType::Boolean);
        adapter
            .write(&coil, Some(&Value::Text("active".into())), None)
            .await
            .unwrap();

        let regs = slave.registers.lock().clone();
        assert_eq!(regs.get(&10), Some(&42));
        assert_eq!((regs.get(&20), regs.get(&21)), (Some(&0x41AC), Some(&0)));
        assert_eq!(slave.coils.lock().get(&5), Some(&true));

        let input = Point::modbus(4, 1, RegisterKind::InputRegister, 1, DataType::UInt16);
        assert!(matches!(
            adapter.write(&input, Some(&Value::Number(1.0)), None).await,
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_device_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut adapter = ModbusAdapter::for_device(
            ModbusTransport::tcp("127.0.0.1", addr.port()),
            1,
            tuning(),
        );
        let points = vec![Arc::new(Point::modbus(
            1,
            1,
            RegisterKind::HoldingRegister,
            0,
            DataType::UInt16,
        ))];
        let err = adapter.read(&points).await.unwrap_err();
        assert!(err.is_transport() || err.is_timeout());
    }

    #[tokio::test]
    async fn test_discovery_probes_units() {
        let slave = FakeSlave::spawn(3).await;
        let mut adapter = ModbusAdapter::for_discovery(ModbusProbeConfig {
            targets: vec![slave.transport()],
            unit_ids: vec![1, 3],
            probe_timeout_ms: 100,
        });
        let candidates = adapter.discover(Duration::from_secs(2)).await.unwrap();
        assert_eq!(candidates.len(), 1);
        let DeviceAddress::Modbus(address) = &candidates[0].address else {
            panic!("expected Modbus candidate");
        };
        assert_eq!(address.unit_id, 3);
        assert_eq!(address.transport, Some(slave.transport()));
    }
}
