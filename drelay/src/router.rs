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

//! The per-query dispatcher: cache lookup, route selection and ordered
//! upstream traversal.

use crate::{cache::MemoryCache, error::RouteError, table::TableHandle, upstream::DefaultsHandle};
use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::{rdata::TXT, DNSClass, RData, Record},
};
use log::*;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{lookup_host, UdpSocket},
    time::timeout,
};

/// Name-plane prefix for administrative commands; never forwarded upstream.
const ADMIN_PREFIX: &str = "clear/";
/// Administrative name wiping the whole cache.
const ADMIN_CLEAR_ALL: &str = "clear/all.";

// Per-server, not per-query; a query traversing n dead servers takes up to
// n times this long before the stale/SERVFAIL disposition.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest upstream datagram we are prepared to receive.
const MAX_LEN: usize = 4096;

/// Query dispatcher holding the shared routing and cache handles.
pub struct Router {
    table: Arc<TableHandle>,
    defaults: Arc<DefaultsHandle>,
    cache: Option<Arc<MemoryCache>>,
}

impl Router {
    /// Create a dispatcher. `cache` is `None` when caching is disabled.
    pub fn new(
        table: Arc<TableHandle>,
        defaults: Arc<DefaultsHandle>,
        cache: Option<Arc<MemoryCache>>,
    ) -> Self {
        Self {
            table,
            defaults,
            cache,
        }
    }

    /// Resolve a parsed query into the reply to send back.
    ///
    /// This never fails: every error path degrades into SERVFAIL (or a stale
    /// answer), so the client only ever sees standard rcodes.
    pub async fn resolve(&self, request: &Message) -> Message {
        let mut reply = reply_to(request);

        let name = match request.queries().first() {
            Some(q) => query_name(q.name()),
            None => {
                // SERVFAIL and NOERROR are the only rcodes this forwarder
                // originates; a question-less message gets the former.
                reply.set_response_code(ResponseCode::ServFail);
                return reply;
            }
        };

        if let Some(target) = name.strip_prefix(ADMIN_PREFIX) {
            return self.admin(reply, &name, target);
        }

        if let Some(cache) = &self.cache {
            if let Some(records) = cache.fresh(&name) {
                debug!("cache hit for {}", name);
                reply.insert_answers(records);
                return reply;
            }
        }

        // Matched servers first, defaults after, each in author order.
        let matched = self.table.lookup(&name);
        let defaults = self.defaults.snapshot();
        let servers = matched
            .iter()
            .flat_map(|list| list.iter())
            .chain(defaults.iter());

        let mut upstream_query = request.clone();
        upstream_query.set_recursion_desired(true);

        let mut answers = None;
        for server in servers {
            match exchange(server, &upstream_query).await {
                Ok(resp) if resp.response_code() == ResponseCode::NoError => {
                    debug!("upstream {} answered for {}", server, name);
                    answers = Some(resp.answers().to_vec());
                    break;
                }
                Ok(resp) => {
                    warn!(
                        "upstream {} returned {} for {}",
                        server,
                        resp.response_code(),
                        name
                    );
                }
                Err(e) => {
                    warn!("upstream {} failed for {}: {}", server, name, e);
                }
            }
        }

        match answers {
            Some(answers) => {
                if let Some(cache) = &self.cache {
                    if !answers.is_empty() {
                        cache.set(&name, &answers);
                    }
                }
                reply.insert_answers(answers);
            }
            None => match self.stale(&name) {
                Some(records) => {
                    info!("all upstreams failed for {}, serving cached answer", name);
                    reply.insert_answers(records);
                }
                None => {
                    reply.set_response_code(ResponseCode::ServFail);
                }
            },
        }
        reply
    }

    // Administrative name plane: `clear/all.` wipes the cache, `clear/<name>`
    // drops a single entry. Answered locally with a TXT status.
    fn admin(&self, reply: Message, name: &str, target: &str) -> Message {
        let cache = match &self.cache {
            Some(c) => c,
            None => return admin_answer(reply, "Cache is disabled"),
        };

        let text = if name == ADMIN_CLEAR_ALL {
            cache.clear();
            info!("cache cleared");
            "Cache cleared"
        } else {
            match cache.delete(target) {
                Ok(()) => {
                    info!("cache entry {} deleted", target);
                    "Cache entry deleted"
                }
                Err(_) => "Cache entry not found",
            }
        };
        admin_answer(reply, text)
    }

    // Any cached answer beats SERVFAIL, expired or not.
    fn stale(&self, name: &str) -> Option<Vec<Record>> {
        self.cache.as_ref()?.get(name).ok()
    }
}

// Raw presentation form: label bytes joined with dots, trailing dot included.
// `Name::to_utf8` escapes bytes it considers unsafe for a hostname, which
// would mangle the `clear/` admin plane and regex matching on such names.
fn query_name(name: &hickory_proto::rr::Name) -> String {
    let mut out = String::new();
    for label in name.iter() {
        out.push_str(&String::from_utf8_lossy(label));
        out.push('.');
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

// Start a reply mirroring the request: same id, opcode and question, with the
// response and recursion-available bits set.
fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .add_queries(request.queries().to_vec());
    reply
}

// Synthesized answers on the admin plane carry TTL 0, class IN.
fn admin_answer(mut reply: Message, text: &str) -> Message {
    let name = match reply.queries().first() {
        Some(q) => q.name().clone(),
        None => return reply,
    };
    let mut record = Record::from_rdata(name, 0, RData::TXT(TXT::new(vec![text.to_owned()])));
    record.set_dns_class(DNSClass::IN);
    reply.add_answer(record);
    reply
}

/// One recursion-desired exchange with a single upstream server.
pub async fn exchange(server: &str, query: &Message) -> Result<Message, RouteError> {
    let addr = lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| RouteError::NoAddress(server.to_owned()))?;

    let socket = UdpSocket::bind(bind_addr(addr.is_ipv4())).await?;
    socket.connect(addr).await?;
    socket.send(&query.to_vec()?).await?;

    timeout(EXCHANGE_TIMEOUT, receive(&socket, query))
        .await
        .map_err(|_| RouteError::Timeout(server.to_owned()))?
}

// Datagrams that fail to parse or that answer a different id are ignored; the
// exchange timeout bounds the whole receive loop.
async fn receive(socket: &UdpSocket, query: &Message) -> Result<Message, RouteError> {
    let mut buf = [0u8; MAX_LEN];
    loop {
        let len = socket.recv(&mut buf).await?;
        let resp = match Message::from_vec(&buf[..len]) {
            Ok(resp) => resp,
            Err(_) => continue,
        };
        if resp.id() != query.id() || resp.message_type() != MessageType::Response {
            continue;
        }
        return Ok(resp);
    }
}

fn bind_addr(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}
