// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP client connections

use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use super::*;

/// Connection options.
///
/// All knobs are enumerated here; there is no hidden global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline applied to every request, measured from submission.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// Establish a direct connection to a Modbus TCP coupler.
pub async fn connect(socket_addr: SocketAddr) -> io::Result<Context> {
    connect_slave(socket_addr, Slave::tcp_device()).await
}

/// Connect to a physical, broadcast, or custom Modbus device,
/// probably through a Modbus TCP gateway that is forwarding
/// messages to/from the corresponding slave device.
pub async fn connect_slave(socket_addr: SocketAddr, slave: Slave) -> io::Result<Context> {
    connect_slave_with_config(socket_addr, slave, Config::default()).await
}

/// Connect to a slave device with explicit connection options.
pub async fn connect_slave_with_config(
    socket_addr: SocketAddr,
    slave: Slave,
    config: Config,
) -> io::Result<Context> {
    let transport = TcpStream::connect(socket_addr).await?;
    Ok(attach_slave_with_config(transport, slave, config))
}

/// Attach a new client context to a direct transport connection.
///
/// The connection could either be an ordinary [`TcpStream`] or a TLS
/// connection.
pub fn attach<T>(transport: T) -> Context
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    attach_slave(transport, Slave::tcp_device())
}

/// Attach a new client context to a transport connection.
///
/// The connection could either be an ordinary [`TcpStream`] or a TLS
/// connection.
pub fn attach_slave<T>(transport: T, slave: Slave) -> Context
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    attach_slave_with_config(transport, slave, Config::default())
}

/// Attach a new client context with explicit connection options.
pub fn attach_slave_with_config<T>(transport: T, slave: Slave, config: Config) -> Context
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let client = crate::service::tcp::Client::new(transport, slave, config.request_timeout);
    Context {
        client: Box::new(client),
    }
}
