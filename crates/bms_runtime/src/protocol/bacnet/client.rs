//! Async BACnet/IP client
//!
//! Owns one UDP socket. Confirmed requests are matched to replies by invoke
//! id and sender, retried on timeout, and classified into adapter errors.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use super::codec::{self, Apdu, IAm, RemoteStation};
use super::config::BacnetNetConfig;
use crate::protocol::{AdapterError, AdapterResult};

/// Abort reason: segmentation-not-supported
const ABORT_SEGMENTATION_NOT_SUPPORTED: u8 = 4;
/// Reject reason: unrecognized-service
const REJECT_UNRECOGNIZED_SERVICE: u8 = 9;

/// Where to send confirmed requests for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: SocketAddr,
    /// Remote network routing when the device sits behind a router
    pub route: Option<RemoteStation>,
}

/// Successful reply to a confirmed request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple,
    Complex(Vec<u8>),
}

/// A device that answered Who-Is
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub i_am: IAm,
    pub addr: SocketAddr,
    pub source: Option<RemoteStation>,
}

/// Retry policy for confirmed requests
#[derive(Debug, Clone, Copy)]
pub struct RequestPolicy {
    pub timeout: Duration,
    pub retries: u8,
}

pub struct BacnetClient {
    socket: UdpSocket,
    broadcast: SocketAddr,
    invoke_id: u8,
    buf: Vec<u8>,
}

impl BacnetClient {
    /// Bind an ephemeral port for device traffic
    pub async fn bind_ephemeral(config: &BacnetNetConfig) -> AdapterResult<Self> {
        let local = config.local_addr(0)?;
        Self::bind(local, config.broadcast_addr()?).await
    }

    /// Bind the configured BACnet port so broadcast I-Am replies arrive,
    /// falling back to an ephemeral port when it is taken.
    pub async fn bind_listener(config: &BacnetNetConfig) -> AdapterResult<Self> {
        let broadcast = config.broadcast_addr()?;
        match Self::bind(config.local_addr(config.port)?, broadcast).await {
            Ok(client) => Ok(client),
            Err(e) => {
                tracing::debug!(port = config.port, error = %e, "BACnet port busy, using ephemeral port");
                Self::bind(config.local_addr(0)?, broadcast).await
            }
        }
    }

    async fn bind(local: SocketAddr, broadcast: SocketAddr) -> AdapterResult<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            broadcast,
            invoke_id: 0,
            buf: vec![0u8; 1500],
        })
    }

    pub fn local_addr(&self) -> AdapterResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn next_invoke_id(&mut self) -> u8 {
        let id = self.invoke_id;
        self.invoke_id = self.invoke_id.wrapping_add(1);
        id
    }

    /// Send a confirmed request and wait for its reply
    ///
    /// `build` receives the invoke id and returns the APDU. A fresh invoke id
    /// is used for every retransmission so late replies are not mistaken for
    /// the current attempt.
    pub async fn request<F>(
        &mut self,
        target: &Target,
        policy: RequestPolicy,
        build: F,
    ) -> AdapterResult<Reply>
    where
        F: Fn(u8) -> BytesMut,
    {
        let attempts = u32::from(policy.retries) + 1;
        for attempt in 1..=attempts {
            let invoke_id = self.next_invoke_id();
            let apdu = build(invoke_id);
            let frame = codec::encode_frame(&apdu, target.route.as_ref(), true, false);
            self.socket.send_to(&frame, target.addr).await?;

            let deadline = Instant::now() + policy.timeout;
            if let Some(result) = self.await_reply(target, invoke_id, deadline).await? {
                return result;
            }
            tracing::trace!(target = %target.addr, invoke_id, attempt, "BACnet request timed out");
        }
        Err(AdapterError::Timeout(policy.timeout * attempts))
    }

    /// Wait for the reply to `invoke_id`. `Ok(None)` means the deadline passed.
    async fn await_reply(
        &mut self,
        target: &Target,
        invoke_id: u8,
        deadline: Instant,
    ) -> AdapterResult<Option<AdapterResult<Reply>>> {
        loop {
            let (len, src) = match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await
            {
                Err(_) => return Ok(None),
                Ok(received) => received?,
            };

            let frame = match codec::decode_frame(&self.buf[..len]) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    tracing::trace!(%src, error = %e, "Ignoring undecodable datagram");
                    continue;
                }
            };
            if src != target.addr && frame.origin != Some(target.addr) {
                continue;
            }
            let apdu = match codec::decode_apdu(frame.apdu) {
                Ok(apdu) => apdu,
                Err(e) => {
                    tracing::trace!(%src, error = %e, "Ignoring undecodable APDU");
                    continue;
                }
            };
            if apdu.reply_invoke_id() != Some(invoke_id) {
                continue;
            }
            return Ok(Some(classify_reply(apdu)));
        }
    }

    /// Broadcast a Who-Is
    pub async fn who_is(&mut self, range: Option<(u32, u32)>) -> AdapterResult<()> {
        let apdu = codec::encode_who_is(range);
        let frame = codec::encode_frame(&apdu, None, false, true);
        self.socket.send_to(&frame, self.broadcast).await?;
        tracing::debug!(broadcast = %self.broadcast, ?range, "Sent Who-Is");
        Ok(())
    }

    /// Collect I-Am replies until `deadline`, one per device instance
    ///
    /// With `stop_on` set, returns as soon as that instance answers.
    pub async fn collect_i_am(
        &mut self,
        deadline: Instant,
        stop_on: Option<u32>,
    ) -> AdapterResult<Vec<Announcement>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        loop {
            let (len, src) = match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await
            {
                Err(_) => break,
                Ok(received) => received?,
            };
            let Ok(Some(frame)) = codec::decode_frame(&self.buf[..len]) else {
                continue;
            };
            let Ok(Apdu::UnconfirmedRequest {
                service: codec::service::I_AM,
                payload,
            }) = codec::decode_apdu(frame.apdu)
            else {
                continue;
            };
            let i_am = match codec::decode_i_am(payload) {
                Ok(i_am) => i_am,
                Err(e) => {
                    tracing::trace!(%src, error = %e, "Malformed I-Am");
                    continue;
                }
            };
            let instance = i_am.device.instance;
            if !seen.insert(instance) {
                continue;
            }
            found.push(Announcement {
                i_am,
                addr: frame.origin.unwrap_or(src),
                source: frame.source.clone(),
            });
            if stop_on == Some(instance) {
                break;
            }
        }

        Ok(found)
    }
}

fn classify_reply(apdu: Apdu<'_>) -> AdapterResult<Reply> {
    match apdu {
        Apdu::SimpleAck { .. } => Ok(Reply::Simple),
        Apdu::ComplexAck {
            segmented: true, ..
        }
        | Apdu::SegmentAck { .. } => Err(AdapterError::Unsupported(
            "segmented response".to_string(),
        )),
        Apdu::ComplexAck { payload, .. } => Ok(Reply::Complex(payload.to_vec())),
        Apdu::Error { class, code, .. } => {
            Err(AdapterError::Remote(codec::describe_error(class, code)))
        }
        Apdu::Reject { reason, .. } if reason == REJECT_UNRECOGNIZED_SERVICE => Err(
            AdapterError::Unsupported("service not recognized by device".to_string()),
        ),
        Apdu::Reject { reason, .. } => Err(AdapterError::Remote(format!("reject reason {}", reason))),
        Apdu::Abort { reason, .. } if reason == ABORT_SEGMENTATION_NOT_SUPPORTED => Err(
            AdapterError::Unsupported("segmented response".to_string()),
        ),
        Apdu::Abort { reason, .. } => Err(AdapterError::Remote(format!("abort reason {}", reason))),
        other => Err(AdapterError::Transport(format!(
            "unexpected reply {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classification() {
        assert_eq!(
            classify_reply(Apdu::SimpleAck {
                invoke_id: 1,
                service: codec::service::WRITE_PROPERTY
            }),
            Ok(Reply::Simple)
        );
        assert!(matches!(
            classify_reply(Apdu::Error {
                invoke_id: 1,
                service: 15,
                class: 2,
                code: 40
            }),
            Err(AdapterError::Remote(msg)) if msg == "property:write-access-denied"
        ));
        assert!(matches!(
            classify_reply(Apdu::Abort {
                invoke_id: 1,
                reason: ABORT_SEGMENTATION_NOT_SUPPORTED
            }),
            Err(AdapterError::Unsupported(_))
        ));
        assert!(matches!(
            classify_reply(Apdu::ComplexAck {
                invoke_id: 1,
                service: 12,
                segmented: true,
                payload: &[]
            }),
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_request_times_out_after_retries() {
        let config = BacnetNetConfig {
            interface: "127.0.0.1".into(),
            port: 0,
            broadcast: Some("127.0.0.1:9".into()),
        };
        // A bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Target {
            addr: silent.local_addr().unwrap(),
            route: None,
        };

        let mut client = BacnetClient::bind_ephemeral(&config).await.unwrap();
        let policy = RequestPolicy {
            timeout: Duration::from_millis(20),
            retries: 1,
        };
        let result = client
            .request(&target, policy, |id| {
                codec::encode_read_property(
                    id,
                    codec::ObjectId::device(1),
                    codec::PropertyRef::new(codec::property::OBJECT_NAME),
                )
            })
            .await;
        assert_eq!(result, Err(AdapterError::Timeout(Duration::from_millis(40))));

        // Both attempts reached the device with distinct invoke ids
        let mut buf = [0u8; 64];
        let (n1, _) = silent.recv_from(&mut buf).await.unwrap();
        let first_id = buf[..n1][8];
        let (n2, _) = silent.recv_from(&mut buf).await.unwrap();
        let second_id = buf[..n2][8];
        assert_ne!(first_id, second_id);
    }
}
