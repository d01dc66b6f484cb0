//! `p2p-over-udp`: BSD-style virtual sockets multiplexed over a few real UDP
//! sockets, plus a reliable byte stream tunnelled inside them.
//!
//! # Architecture
//!
//! ```text
//!  callers ── NetStack API (socket/bind/connect/send/recv/poll/close)
//!                 │
//!     ┌───────────┴────────────┐
//!     │      SocketTable       │  SocketId ─▶ VirtualSocket
//!     │  ┌──────────────────┐  │    ├── DatagramSocket
//!     │  │ WaitQueue/socket │  │    └── StreamSocket ── Sender / ReceiveBuffer
//!     │  └──────────────────┘  │                │
//!     └───────────┬────────────┘                │ track / confirm
//!                 │ deliver()           ┌───────▼───────────┐
//!          ┌──────┴───────┐             │ RetransmitMonitor │ (timer task)
//!          │ PortRegistry │◀────────────┴───────────────────┘
//!          │ LogicalPort* │  one real UdpSocket each, vport maps
//!          └──────┬───────┘
//!                 │ reader task per port ─▶ dispatcher task
//!           raw UDP datagrams
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: wire format (multiplexing header, stream segments)
//! - [`registry`]: logical ports, vport claims, inbound routing
//! - [`dispatch`]: reader and dispatcher tasks
//! - [`socket`]: socket ids, addresses, the socket kinds and their table
//! - [`datagram`]: connectionless virtual sockets
//! - [`stream`]: the stream handshake and data engine
//! - [`sender`] / [`receiver`]: sequence numbering and reassembly
//! - [`retransmit`] / [`timer`]: resend scheduling and timeout estimation
//! - [`waiters`]: blocked callers and readiness events
//! - [`options`]: per-socket option cache
//! - [`stack`]: the [`NetStack`] context tying it together
//! - [`simulator`]: optional loss/duplication/reordering for tests

pub mod config;
pub mod datagram;
pub mod dispatch;
pub mod error;
pub mod options;
pub mod packet;
pub mod receiver;
pub mod registry;
pub mod retransmit;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod stack;
pub mod state;
pub mod stream;
pub mod timer;
pub mod waiters;

pub use config::{NetConfig, RetransmitConfig};
pub use error::{NetError, NetResult};
pub use options::{Linger, SockOpt, SockOptName, Timeval};
pub use socket::{RecvFlags, SocketId, VirtualAddr, AF_INET, SOCK_DGRAM_P2P, SOCK_STREAM_P2P};
pub use stack::{NetStack, PollFd};
pub use state::{Failure, StreamState};
pub use waiters::{CallerId, PollEvents};
