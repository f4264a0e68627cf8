// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-stream transport to the sensor.
//!
//! The session core only needs "open a reliable byte stream to address X".
//! [`RfcommTransport`] provides that over BlueZ RFCOMM.

use async_trait::async_trait;
use bluer::rfcomm::{ConnectRequest, Profile, ProfileHandle, ReqError, Role, SocketAddr, Stream};
use bluer::{Adapter, Address, Device, Session};
use std::time::Duration;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// RFCOMM channel SPP devices listen on when no SDP record says otherwise.
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// How long BlueZ may take to hand over the socket after connecting.
const PROFILE_HANDOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
}

/// Readable byte stream returned by a transport.
pub trait ByteStream: AsyncRead + Send + Unpin {}

impl<T: AsyncRead + Send + Unpin + ?Sized> ByteStream for T {}

/// Boxed stream handed to the connection worker.
pub type BoxedStream = Box<dyn ByteStream>;

/// Platform capability used by the session manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve an address into a connectable device.
    ///
    /// Resolution is synchronous and must not touch the radio.
    fn resolve(&self, address: &str) -> Result<DeviceHandle, TransportError>;

    /// Stop any device discovery that would slow down connection setup.
    ///
    /// Best effort. A platform that cannot stop a scan started by another
    /// client may only report it and return `Ok`.
    async fn cancel_discovery(&self) -> Result<(), TransportError>;

    /// Open a byte stream to the device. May block for a long time.
    async fn open(&self, device: &DeviceHandle) -> Result<BoxedStream, TransportError>;
}

/// RFCOMM transport backed by BlueZ.
///
/// Connects by looking up the SPP service record first. If that fails it
/// falls back to the configured RFCOMM channel, then to channel 1.
pub struct RfcommTransport {
    bluez: Option<(Session, Adapter)>,
    /// SPP client profile, registered on first use.
    profile: Mutex<Option<ProfileHandle>>,
    channel: u8,
}

impl RfcommTransport {
    /// Create a new RFCOMM transport on the default adapter.
    ///
    /// A missing adapter is not an error here; every connection attempt
    /// reports it instead.
    pub async fn new(channel: u8) -> Self {
        info!("Initializing Bluetooth transport...");

        let bluez = match Self::default_adapter().await {
            Ok((session, adapter)) => {
                info!("Using Bluetooth adapter: {}", adapter.name());
                Some((session, adapter))
            }
            Err(e) => {
                warn!("No usable Bluetooth adapter: {}", e);
                None
            }
        };

        Self {
            bluez,
            profile: Mutex::new(None),
            channel,
        }
    }

    async fn default_adapter() -> bluer::Result<(Session, Adapter)> {
        let session = Session::new().await?;
        debug!("BlueZ session created");

        let adapter = session.default_adapter().await?;

        // Ensure adapter is powered on
        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok((session, adapter))
    }

    fn bluez(&self) -> Result<&(Session, Adapter), TransportError> {
        self.bluez
            .as_ref()
            .ok_or_else(|| TransportError::AdapterUnavailable("no default adapter".to_string()))
    }

    fn parse_address(address: &str) -> Result<Address, TransportError> {
        address
            .trim()
            .parse::<Address>()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))
    }

    /// Client-side SPP profile registered with BlueZ.
    fn spp_profile() -> Profile {
        Profile {
            uuid: SPP_UUID,
            name: Some("Blueteeth SPP".to_string()),
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        }
    }

    /// Channels tried when the service lookup fails, in order.
    fn fallback_channels(&self) -> Vec<u8> {
        if self.channel == DEFAULT_RFCOMM_CHANNEL {
            vec![self.channel]
        } else {
            vec![self.channel, DEFAULT_RFCOMM_CHANNEL]
        }
    }

    /// Connect through the SPP service record found by SDP.
    async fn connect_service(&self, address: Address) -> Result<Stream, TransportError> {
        let (session, adapter) = self.bluez()?;
        let device = adapter.device(address).map_err(map_bluer_error)?;

        let mut profile = self.profile.lock().await;
        if profile.is_none() {
            let handle = session
                .register_profile(Self::spp_profile())
                .await
                .map_err(map_bluer_error)?;
            debug!("Registered SPP client profile");
            *profile = Some(handle);
        }
        let Some(handle) = profile.as_mut() else {
            return Err(TransportError::AdapterUnavailable(
                "SPP profile not registered".to_string(),
            ));
        };

        debug!("Connecting SPP service on {}", address);
        let result = Self::await_socket(handle, &device, address).await;
        if result.is_err() {
            // Register afresh on the next attempt
            *profile = None;
        }
        result
    }

    async fn await_socket(
        handle: &mut ProfileHandle,
        device: &Device,
        address: Address,
    ) -> Result<Stream, TransportError> {
        // BlueZ hands the socket to the profile while the connect call is
        // still pending, so both are polled together
        let connect = device.connect_profile(&SPP_UUID);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    result.map_err(map_bluer_error)?;
                    break;
                }
                request = handle.next() => {
                    if let Some(stream) = accept_request(request, address)? {
                        return Ok(stream);
                    }
                }
            }
        }

        let handover = async {
            loop {
                if let Some(stream) = accept_request(handle.next().await, address)? {
                    return Ok::<_, TransportError>(stream);
                }
            }
        };
        tokio::time::timeout(PROFILE_HANDOVER_TIMEOUT, handover)
            .await
            .map_err(|_| {
                TransportError::AdapterUnavailable("SPP socket was not handed over".to_string())
            })?
    }

    async fn connect_channel(address: Address, channel: u8) -> std::io::Result<Stream> {
        debug!("Connecting RFCOMM {} channel {}", address, channel);
        Stream::connect(SocketAddr::new(address, channel)).await
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    fn resolve(&self, address: &str) -> Result<DeviceHandle, TransportError> {
        let address = Self::parse_address(address)?;
        let (_, adapter) = self.bluez()?;

        adapter.device(address).map_err(map_bluer_error)?;

        Ok(DeviceHandle {
            address: address.to_string(),
        })
    }

    async fn cancel_discovery(&self) -> Result<(), TransportError> {
        let (_, adapter) = self.bluez()?;

        // BlueZ only stops discovery on behalf of the client that started it
        if adapter.is_discovering().await.map_err(map_bluer_error)? {
            warn!("Adapter is discovering; connection setup may be slow");
        }
        Ok(())
    }

    async fn open(&self, device: &DeviceHandle) -> Result<BoxedStream, TransportError> {
        let address = Self::parse_address(&device.address)?;
        info!("Opening SPP connection to {} (UUID: {})", address, SPP_UUID);

        match self.connect_service(address).await {
            Ok(stream) => return Ok(Box::new(stream)),
            Err(e) => warn!("SPP service lookup on {} failed: {}", address, e),
        }

        let mut last_error = None;
        for channel in self.fallback_channels() {
            match Self::connect_channel(address, channel).await {
                Ok(stream) => {
                    info!("Connected to {} on RFCOMM channel {}", address, channel);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    warn!("RFCOMM channel {} on {} failed: {}", channel, address, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(TransportError::Io)
            .unwrap_or_else(|| TransportError::AdapterUnavailable("no RFCOMM channel".to_string())))
    }
}

/// Accept a profile connection from `address`, rejecting anything else.
fn accept_request(
    request: Option<ConnectRequest>,
    address: Address,
) -> Result<Option<Stream>, TransportError> {
    match request {
        Some(request) if request.device() == address => {
            request.accept().map(Some).map_err(map_bluer_error)
        }
        Some(request) => {
            debug!("Rejecting SPP connection from {}", request.device());
            request.reject(ReqError::Rejected);
            Ok(None)
        }
        None => Err(TransportError::AdapterUnavailable(
            "SPP profile was unregistered".to_string(),
        )),
    }
}

fn map_bluer_error(e: bluer::Error) -> TransportError {
    match e.kind {
        bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
            TransportError::PermissionDenied(e.message)
        }
        _ => TransportError::AdapterUnavailable(e.to_string()),
    }
}
