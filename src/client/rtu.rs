// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU client connections

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::*;

/// Connection options.
///
/// The baud rate only drives the inter-character silence thresholds
/// (`t1.5`/`t3.5`); configuring the serial line itself is the job of
/// whoever opens the port.
#[derive(Debug, Clone)]
pub struct Config {
    /// Line speed the silence thresholds are derived from.
    pub baud_rate: u32,
    /// Deadline applied to every request, measured from submission.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: 19_200,
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// Attach a new client context to a serial transport, e.g. an already
/// configured serial port.
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
    let client = crate::service::rtu::Client::new(
        transport,
        slave,
        config.baud_rate,
        config.request_timeout,
    );
    Context {
        client: Box::new(client),
    }
}
