// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MBAP (TCP) framing end to end, including transaction id preservation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use modbus_link::client::{Client, ClientConfig, ClientEvent};
use modbus_link::frame::{READ_HOLDING_REGISTERS, TransferMode};
use modbus_link::io::{IoDevice, IoEvent};
use modbus_link::server::Server;

#[derive(Default)]
struct Wire {
    /// (request frame, response frame) pairs seen on the wire.
    exchanges: Vec<(Vec<u8>, Vec<u8>)>,
}

struct LoopbackDevice {
    server: Arc<Mutex<Server>>,
    wire: Arc<Mutex<Wire>>,
    events: mpsc::UnboundedReceiver<IoEvent>,
    feeder: mpsc::UnboundedSender<IoEvent>,
    rx_data: Vec<u8>,
}

impl LoopbackDevice {
    fn new(server: Server) -> Self {
        let (feeder, events) = mpsc::unbounded_channel();
        Self {
            server: Arc::new(Mutex::new(server)),
            wire: Arc::new(Mutex::new(Wire::default())),
            events,
            feeder,
            rx_data: Vec::new(),
        }
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
            self.wire
                .lock()
                .unwrap()
                .exchanges
                .push((data.to_vec(), response.to_vec()));
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
        "loopback-mbap"
    }

    async fn next_event(&mut self) -> Option<IoEvent> {
        self.events.recv().await
    }
}

#[tokio::test(start_paused = true)]
async fn transaction_id_is_copied_into_the_response() {
    let mut server = Server::new(1, TransferMode::Mbap);
    server.handle_holding_registers(0, 4);
    server.set_holding_register(0, 0x0007).unwrap();

    let device = LoopbackDevice::new(server);
    let wire = device.wire.clone();

    let config = ClientConfig {
        transfer_mode: TransferMode::Mbap,
        frame_interval: std::time::Duration::ZERO,
        ..ClientConfig::default()
    };
    let (client, mut events) = Client::new(device, config);
    client.open().unwrap();
    loop {
        if let ClientEvent::Opened = events.recv().await.unwrap() {
            break;
        }
    }

    for _ in 0..3 {
        client.read_registers(1, READ_HOLDING_REGISTERS, 0, 1).unwrap();
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::ReadRegistersFinished { values, error, .. } => {
                    assert_eq!(values, vec![0x0007]);
                    assert_eq!(error, None);
                    break;
                }
                _ => continue,
            }
        }
    }

    let wire = wire.lock().unwrap();
    assert_eq!(wire.exchanges.len(), 3);
    for (request, response) in &wire.exchanges {
        // MBAP header: txn id (2), protocol id (2), length (2), unit id
        assert_eq!(request[..2], response[..2]);
        assert_eq!(&response[2..4], &[0x00, 0x00]);
        assert_eq!(response[6], 0x01);
    }
    // transaction ids are distinct per request
    assert_ne!(wire.exchanges[0].0[..2], wire.exchanges[1].0[..2]);
}
