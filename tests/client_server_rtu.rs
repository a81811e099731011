// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end client/server scenarios over an in-memory RTU transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use modbus_link::client::{Client, ClientConfig, ClientEvent};
use modbus_link::frame::{Exception, READ_COILS, READ_HOLDING_REGISTERS, TransferMode};
use modbus_link::io::{IoDevice, IoEvent};
use modbus_link::server::Server;

/// A transport that hands every written frame straight to a server engine
/// and loops the responses back to the client.
struct LoopbackDevice {
    server: Arc<Mutex<Server>>,
    events: mpsc::UnboundedReceiver<IoEvent>,
    feeder: mpsc::UnboundedSender<IoEvent>,
    rx_data: Vec<u8>,
}

impl LoopbackDevice {
    fn new(server: Server) -> Self {
        let (feeder, events) = mpsc::unbounded_channel();
        Self {
            server: Arc::new(Mutex::new(server)),
            events,
            feeder,
            rx_data: Vec::new(),
        }
    }

    fn server_handle(&self) -> Arc<Mutex<Server>> {
        self.server.clone()
    }
}

#[async_trait]
impl IoDevice for LoopbackDevice {
    fn open(&mut self) {
        self.feeder.send(IoEvent::Opened).unwrap();
    }

    fn close(&mut self) {
        self.feeder.send(IoEvent::Closed).unwrap();
    }

    fn write(&mut self, data: &[u8]) {
        let responses = self.server.lock().unwrap().feed(data);
        self.feeder.send(IoEvent::BytesWritten(data.len())).unwrap();
        for response in responses {
            self.rx_data.extend_from_slice(&response);
            self.feeder.send(IoEvent::ReadyRead).unwrap();
        }
    }

    fn read_all(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.rx_data))
    }

    fn clear(&mut self) {
        self.rx_data.clear();
    }

    fn name(&self) -> &str {
        "loopback"
    }

    async fn next_event(&mut self) -> Option<IoEvent> {
        self.events.recv().await
    }
}

async fn open_and_wait(client: &Client, events: &mut mpsc::UnboundedReceiver<ClientEvent>) {
    client.open().unwrap();
    loop {
        if let ClientEvent::Opened = events.recv().await.expect("event stream ended") {
            return;
        }
    }
}

fn rtu_pair(server: Server) -> (Client, mpsc::UnboundedReceiver<ClientEvent>, Arc<Mutex<Server>>) {
    let device = LoopbackDevice::new(server);
    let server_handle = device.server_handle();
    let (client, events) = Client::new(device, ClientConfig::default());
    (client, events, server_handle)
}

#[tokio::test(start_paused = true)]
async fn read_coils() {
    let mut server = Server::new(1, TransferMode::Rtu);
    server.handle_coils(0, 16);
    server.set_coil(10, true).unwrap();
    server.set_coil(11, false).unwrap();
    server.set_coil(12, true).unwrap();

    let (client, mut events, _server) = rtu_pair(server);
    open_and_wait(&client, &mut events).await;
    client.read_single_bits(1, READ_COILS, 10, 3).unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::ReadSingleBitsFinished {
                server_address,
                function_code,
                start_address,
                quantity,
                values,
                error,
            } => {
                assert_eq!(server_address, 1);
                assert_eq!(function_code, READ_COILS);
                assert_eq!(start_address, 10);
                assert_eq!(quantity, 3);
                assert_eq!(values, vec![true, false, true]);
                assert_eq!(error, None);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn read_holding_registers() {
    let mut server = Server::new(1, TransferMode::Rtu);
    server.handle_holding_registers(0, 4);
    for (address, value) in [(0, 1u16), (1, 2), (2, 3), (3, 4)] {
        server.set_holding_register(address, value).unwrap();
    }

    let (client, mut events, _server) = rtu_pair(server);
    open_and_wait(&client, &mut events).await;
    client.read_registers(1, READ_HOLDING_REGISTERS, 0, 4).unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::ReadRegistersFinished { values, error, .. } => {
                assert_eq!(values, vec![0x0001, 0x0002, 0x0003, 0x0004]);
                assert_eq!(error, None);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn write_single_coil_guard_denial() {
    let mut server = Server::new(1, TransferMode::Rtu);
    server.handle_coils(1, 10);
    server.set_can_write_single_bit(Box::new(|address, _| {
        (address == 1).then_some(Exception::ServerDeviceBusy)
    }));

    let (client, mut events, _server) = rtu_pair(server);
    open_and_wait(&client, &mut events).await;
    client.write_single_coil(1, 1, false).unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::WriteSingleCoilFinished { address, error, .. } => {
                assert_eq!(address, 1);
                assert_eq!(error, Some(Exception::ServerDeviceBusy));
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn write_registers_then_read_them_back() {
    let mut server = Server::new(1, TransferMode::Rtu);
    server.handle_holding_registers(0, 8);

    let (client, mut events, server) = rtu_pair(server);
    open_and_wait(&client, &mut events).await;

    client
        .write_multiple_registers(1, 2, &[0xAB, 0xCD])
        .unwrap();
    client.read_registers(1, READ_HOLDING_REGISTERS, 2, 2).unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::WriteMultipleRegistersFinished {
                start_address,
                error,
                ..
            } => {
                assert_eq!(start_address, 2);
                assert_eq!(error, None);
            }
            ClientEvent::ReadRegistersFinished { values, error, .. } => {
                assert_eq!(values, vec![0xAB, 0xCD]);
                assert_eq!(error, None);
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(server.lock().unwrap().holding_register(2), Some(0xAB));
}

#[tokio::test(start_paused = true)]
async fn read_write_multiple_registers() {
    let mut server = Server::new(1, TransferMode::Rtu);
    server.handle_holding_registers(0, 8);
    server.set_holding_register(4, 0x1111).unwrap();

    let (client, mut events, _server) = rtu_pair(server);
    open_and_wait(&client, &mut events).await;

    // write 0x2222 to register 4 and read it back in the same transaction
    client
        .read_write_multiple_registers(1, 4, 1, 4, &[0x2222])
        .unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::ReadWriteMultipleRegistersFinished {
                start_address,
                values,
                error,
                ..
            } => {
                assert_eq!(start_address, 4);
                assert_eq!(values, vec![0x2222]);
                assert_eq!(error, None);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn out_of_region_read_surfaces_exception() {
    let mut server = Server::new(1, TransferMode::Rtu);
    server.handle_coils(0, 8);

    let (client, mut events, _server) = rtu_pair(server);
    open_and_wait(&client, &mut events).await;
    client.read_single_bits(1, READ_COILS, 4, 8).unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::ReadSingleBitsFinished { values, error, .. } => {
                assert_eq!(error, Some(Exception::IllegalDataAddress));
                // the access object is passed through un-updated
                assert!(values.is_empty());
                break;
            }
            _ => continue,
        }
    }
}
