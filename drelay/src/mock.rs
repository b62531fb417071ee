// Copyright 2024 Yann Prado
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! This module is NOT intended to be used by regular users. It is used for
//! mocking purpose only.

use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::Record,
};
use std::io;
use tokio::net::UdpSocket;

/// What the mock upstream does with every incoming query.
pub enum Behavior {
    /// Reply NOERROR with these records as the answer section.
    Answer(Vec<Record>),
    /// Reply with the given rcode and no answers.
    Rcode(ResponseCode),
    /// Swallow the query, simulating a dead upstream.
    Silent,
}

/// Mock upstream server answering every query the same way.
pub struct Server {
    socket: UdpSocket,
    behavior: Behavior,
}

impl Server {
    /// Bind a mock upstream on an ephemeral localhost port.
    pub async fn bind(behavior: Behavior) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
            behavior,
        })
    }

    /// The address queries should be sent to, as a `host:port` string.
    pub fn addr(&self) -> io::Result<String> {
        Ok(self.socket.local_addr()?.to_string())
    }

    /// Serve queries until the task is dropped.
    pub async fn run(self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let query = match Message::from_vec(&buf[..len]) {
                Ok(q) => q,
                Err(_) => continue,
            };

            let mut reply = Message::new();
            reply
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(query.op_code())
                .set_recursion_desired(query.recursion_desired())
                .set_recursion_available(true)
                .add_queries(query.queries().to_vec());

            match &self.behavior {
                Behavior::Answer(records) => {
                    reply.insert_answers(records.clone());
                }
                Behavior::Rcode(code) => {
                    reply.set_response_code(*code);
                }
                Behavior::Silent => continue,
            }

            let bytes = match reply.to_vec() {
                Ok(b) => b,
                Err(_) => continue,
            };
            self.socket.send_to(&bytes, peer).await?;
        }
    }
}
