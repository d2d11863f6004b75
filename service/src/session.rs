//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Per-request view of the sender

use crate::error::{MasterError, Result};
use crate::types::{ConnectionId, Origin, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use umaster_codec::Message;

/// Path for replies sent after the request has been handled
#[derive(Debug, Clone)]
pub enum Responder {
    /// Reply queue of a TCP connection worker
    Stream(mpsc::Sender<Message>),
    /// Shared UDP socket and the datagram's source
    Datagram {
        /// Listening socket
        socket: Arc<UdpSocket>,
        /// Where the request came from
        peer: SocketAddr,
    },
}

impl Responder {
    /// Deliver `message`
    pub async fn send(&self, message: Message) -> Result<()> {
        match self {
            Responder::Stream(tx) => tx
                .send(message)
                .await
                .map_err(|_| MasterError::ConnectionClosed),
            Responder::Datagram { socket, peer } => {
                socket.send_to(message.encode().as_bytes(), *peer).await?;
                Ok(())
            }
        }
    }
}

/// Everything a handler knows about the sender of a request
#[derive(Debug, Clone)]
pub struct Session {
    id: Option<ConnectionId>,
    transport: Transport,
    peer: SocketAddr,
    cancel: CancellationToken,
    responder: Responder,
    max_payload: usize,
}

impl Session {
    /// Session of a TCP connection
    pub fn tcp(
        id: ConnectionId,
        peer: SocketAddr,
        cancel: CancellationToken,
        replies: mpsc::Sender<Message>,
        max_payload: usize,
    ) -> Self {
        Self {
            id: Some(id),
            transport: Transport::Tcp,
            peer,
            cancel,
            responder: Responder::Stream(replies),
            max_payload,
        }
    }

    /// Session of one datagram
    pub fn udp(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        cancel: CancellationToken,
        max_payload: usize,
    ) -> Self {
        Self {
            id: None,
            transport: Transport::Udp,
            peer,
            cancel,
            responder: Responder::Datagram { socket, peer },
            max_payload,
        }
    }

    /// Connection id, TCP only
    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    /// Transport the request arrived on
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Sender address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Identity used to group work from the same sender
    pub fn origin(&self) -> Origin {
        match self.id {
            Some(id) => Origin::Tcp(id),
            None => Origin::Udp(self.peer),
        }
    }

    /// Fires when the sender goes away
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Out-of-band reply path
    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Largest reply packet the transport carries
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_responder() {
        let (tx, mut rx) = mpsc::channel(1);
        let session = Session::tcp(
            ConnectionId::new(3),
            "10.0.0.9:4000".parse().unwrap(),
            CancellationToken::new(),
            tx,
            1024,
        );
        assert_eq!(session.origin(), Origin::Tcp(ConnectionId::new(3)));

        session.responder().send(Message::Pong { token: 5 }).await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::Pong { token: 5 }));

        drop(rx);
        let err = session
            .responder()
            .send(Message::Pong { token: 6 })
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_datagram_responder() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = client.local_addr().unwrap();

        let session = Session::udp(server, peer, CancellationToken::new(), 1200);
        assert_eq!(session.origin(), Origin::Udp(peer));
        session.responder().send(Message::Pong { token: 1 }).await.unwrap();

        let mut buf = [0u8; 64];
        let len = client.recv(&mut buf).await.unwrap();
        assert_eq!(Message::decode_bytes(&buf[..len]).unwrap(), Message::Pong { token: 1 });
    }
}
