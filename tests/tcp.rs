// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end Modbus/TCP scenarios against a hand-rolled peer stub
//! speaking raw MBAP over an in-memory pipe.

#![cfg(feature = "tcp")]

mod common;

use std::time::Duration;

use common::{init_logging, read_mbap_frame, write_mbap_frame};
use tokio::io::AsyncWriteExt as _;
use tokio_modbus_client::{
    client::{
        self,
        tcp::Config,
    },
    prelude::*,
    Error, Exception,
};

fn test_config() -> Config {
    Config {
        request_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn read_holding_registers_roundtrip() -> anyhow::Result<()> {
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let mut ctx = client::tcp::attach_slave_with_config(client_io, Slave(0x01), test_config());

    let server = tokio::spawn(async move {
        let (tid, uid, pdu) = read_mbap_frame(&mut server_io).await?;
        assert_eq!(uid, 0x01);
        assert_eq!(pdu, vec![0x03, 0x00, 0x6B, 0x00, 0x03]);
        write_mbap_frame(
            &mut server_io,
            tid,
            uid,
            &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64],
        )
        .await?;
        anyhow::Ok(server_io)
    });

    let data = ctx.read_holding_registers(0x6B, 3).await?;
    assert_eq!(data, vec![0x022B, 0x0000, 0x0064]);

    server.await??;
    Ok(())
}

#[tokio::test]
async fn server_exception_surfaces_to_the_caller() -> anyhow::Result<()> {
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let mut ctx = client::tcp::attach_slave_with_config(client_io, Slave(17), test_config());

    let server = tokio::spawn(async move {
        let (tid, uid, pdu) = read_mbap_frame(&mut server_io).await?;
        assert_eq!(uid, 17);
        assert_eq!(pdu[0], 0x01);
        write_mbap_frame(&mut server_io, tid, uid, &[0x81, 0x02]).await?;
        anyhow::Ok(server_io)
    });

    let err = ctx.read_coils(0x00, 1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Exception(Exception::IllegalDataAddress)
    ));

    server.await??;
    Ok(())
}

#[tokio::test]
async fn mbap_wire_format_is_bit_exact() -> anyhow::Result<()> {
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let mut ctx = client::tcp::attach_slave_with_config(client_io, Slave(0x01), test_config());

    let zero_registers = |cnt: usize| {
        let mut pdu = vec![0x03, u8::try_from(cnt * 2).unwrap()];
        pdu.extend(std::iter::repeat(0x00).take(cnt * 2));
        pdu
    };

    let server = tokio::spawn(async move {
        use tokio::io::AsyncReadExt as _;
        // First transaction is allocated identifier 0.
        let mut raw = [0u8; 12];
        server_io.read_exact(&mut raw).await?;
        assert_eq!(
            raw,
            [0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
        write_mbap_frame(&mut server_io, 0x0000, 0x01, &zero_registers(10)).await?;

        // The second transaction increments the identifier.
        server_io.read_exact(&mut raw).await?;
        assert_eq!(
            raw,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
        write_mbap_frame(&mut server_io, 0x0001, 0x01, &zero_registers(10)).await?;
        anyhow::Ok(server_io)
    });

    ctx.read_holding_registers(0x0000, 10).await?;
    ctx.read_holding_registers(0x0000, 10).await?;

    server.await??;
    Ok(())
}

#[tokio::test]
async fn timeout_expires_and_late_response_is_dropped() -> anyhow::Result<()> {
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let config = Config {
        request_timeout: Duration::from_millis(50),
    };
    let mut ctx = client::tcp::attach_slave_with_config(client_io, Slave(0x01), config);

    let server = tokio::spawn(async move {
        let (tid1, uid, _) = read_mbap_frame(&mut server_io).await?;
        // Let the first transaction expire, then answer it anyway.
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_mbap_frame(&mut server_io, tid1, uid, &[0x03, 0x02, 0xDE, 0xAD]).await?;

        let (tid2, uid, _) = read_mbap_frame(&mut server_io).await?;
        assert_ne!(tid2, tid1);
        write_mbap_frame(&mut server_io, tid2, uid, &[0x03, 0x02, 0x00, 0x2A]).await?;
        anyhow::Ok(server_io)
    });

    let err = ctx.read_holding_registers(0x10, 1).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // Give the late response time to arrive; it belongs to no pending
    // transaction any more and is dropped.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A fresh transaction must not be completed by the stale frame.
    let data = ctx.read_holding_registers(0x10, 1).await?;
    assert_eq!(data, vec![0x002A]);

    server.await??;
    Ok(())
}

#[tokio::test]
async fn disconnect_drains_all_pending_requests() -> anyhow::Result<()> {
    init_logging();
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let ctx = client::tcp::attach_slave_with_config(client_io, Slave(0x01), test_config());

    let server = tokio::spawn(async move {
        for _ in 0..3 {
            read_mbap_frame(&mut server_io).await?;
        }
        // Drop the connection without answering anything.
        server_io.shutdown().await?;
        drop(server_io);
        anyhow::Ok(())
    });

    let mut c1 = ctx.clone();
    let mut c2 = ctx.clone();
    let mut c3 = ctx;
    let results = futures::future::join_all([
        c1.read_holding_registers(0x01, 1),
        c2.read_holding_registers(0x02, 1),
        c3.read_holding_registers(0x03, 1),
    ])
    .await;
    for result in results {
        assert!(matches!(result, Err(Error::ConnectionLost(_))));
    }

    // The connection stays gone: new requests fail fast.
    let err = c1.read_holding_registers(0x01, 1).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)));

    server.await??;
    Ok(())
}

#[tokio::test]
async fn responses_are_correlated_out_of_order() -> anyhow::Result<()> {
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let ctx = client::tcp::attach_slave_with_config(client_io, Slave(0x01), test_config());

    let server = tokio::spawn(async move {
        let (tid1, uid1, pdu1) = read_mbap_frame(&mut server_io).await?;
        let (tid2, uid2, pdu2) = read_mbap_frame(&mut server_io).await?;
        // Answer in reverse order; the payload echoes the requested
        // start address so the test can tell the responses apart.
        write_mbap_frame(&mut server_io, tid2, uid2, &[0x03, 0x02, 0x00, pdu2[2]]).await?;
        write_mbap_frame(&mut server_io, tid1, uid1, &[0x03, 0x02, 0x00, pdu1[2]]).await?;
        anyhow::Ok(server_io)
    });

    let mut c1 = ctx.clone();
    let mut c2 = ctx;
    let (r1, r2) = tokio::join!(
        c1.read_holding_registers(0x10, 1),
        c2.read_holding_registers(0x20, 1),
    );
    assert_eq!(r1?, vec![0x0010]);
    assert_eq!(r2?, vec![0x0020]);

    server.await??;
    Ok(())
}
