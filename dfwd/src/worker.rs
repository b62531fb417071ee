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

use anyhow::Result;
use drelay::Router;
use hickory_proto::op::Message;
use log::*;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;

/// Handle a single incoming packet.
pub async fn handle(
    router: Arc<Router>,
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
    src: SocketAddr,
) -> Result<()> {
    let request = Message::from_vec(&buf)?;
    if let Some(q) = request.queries().first() {
        debug!("received query from {} for {}", src, q.name().to_utf8());
    }

    let reply = router.resolve(&request).await;
    socket.send_to(&reply.to_vec()?, src).await?;
    Ok(())
}
