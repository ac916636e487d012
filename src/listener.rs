use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use thiserror::Error;
use tracing::{debug, info};

/// Slot a successor finds its listening socket at: the first one after
/// stdin, stdout and stderr.
pub const INHERITED_FD: RawFd = 3;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Unable to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Inherited descriptor {fd} is not a usable listening socket: {reason}")]
    InheritedDescriptor { fd: RawFd, reason: String },
}

/// A bound, listening TCP socket owned by this process.
#[derive(Debug)]
pub struct ListenerHandle {
    socket: Socket,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A second descriptor for the same socket, close-on-exec.
    pub fn duplicate(&self) -> io::Result<Socket> {
        self.socket.try_clone()
    }

    /// Tokio listener over a duplicate descriptor. Dropping it stops this
    /// process accepting without closing the handle itself.
    pub fn to_tokio(&self) -> io::Result<tokio::net::TcpListener> {
        let socket = self.duplicate()?;
        socket.set_nonblocking(true)?;

        tokio::net::TcpListener::from_std(socket.into())
    }
}

impl AsRawFd for ListenerHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Fresh boot binds `addr`, reborn boot adopts [`INHERITED_FD`].
pub fn acquire_listener(
    reborn: bool,
    addr: &str,
    backlog: i32,
) -> Result<ListenerHandle, ListenerError> {
    let handle = if reborn {
        adopt_descriptor(INHERITED_FD)?
    } else {
        bind_listener(addr, backlog)?
    };

    info!(
        reborn,
        fd = handle.as_raw_fd(),
        addr = %handle.local_addr(),
        "Listener acquired"
    );

    Ok(handle)
}

pub fn bind_listener(addr: &str, backlog: i32) -> Result<ListenerHandle, ListenerError> {
    let bind_error = |source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let ip_addr = resolve_addr(addr).map_err(bind_error)?;
    let socket = create_listener_socket(ip_addr, backlog).map_err(bind_error)?;
    let local_addr = local_socket_addr(&socket).map_err(bind_error)?;

    Ok(ListenerHandle { socket, local_addr })
}

/// Takes ownership of `fd` once it has been checked to be a listening
/// TCP socket. On failure the descriptor is left untouched unless it was
/// already a socket.
pub fn adopt_descriptor(fd: RawFd) -> Result<ListenerHandle, ListenerError> {
    let inherited_error = |reason: String| ListenerError::InheritedDescriptor { fd, reason };

    if !is_socket(fd) {
        return Err(inherited_error(String::from("no open socket at this slot")));
    }

    // SAFETY: fstat confirmed an open socket, and nothing else in this
    // process claims the inherited slot.
    let socket = unsafe { Socket::from_raw_fd(fd) };

    #[cfg(target_os = "linux")]
    {
        match socket.is_listener() {
            Ok(true) => (),
            Ok(false) => return Err(inherited_error(String::from("socket is not listening"))),
            Err(e) => return Err(inherited_error(e.to_string())),
        }
    }

    let local_addr = local_socket_addr(&socket).map_err(|e| inherited_error(e.to_string()))?;

    socket
        .set_cloexec(true)
        .and_then(|_| socket.set_nonblocking(true))
        .map_err(|e| inherited_error(e.to_string()))?;

    debug!(fd, addr = %local_addr, "Adopted inherited listener");

    Ok(ListenerHandle { socket, local_addr })
}

/// Accepts `host:port`, `ip:port`, and `:port` for every IPv4 interface.
pub fn resolve_addr(addr: &str) -> io::Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };

    normalized.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} did not resolve to any address", addr),
        )
    })
}

pub fn create_listener_socket(ip_addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(ip_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&ip_addr.into())?;
    socket.listen(backlog)?;

    Ok(socket)
}

fn local_socket_addr(socket: &Socket) -> io::Result<SocketAddr> {
    socket.local_addr()?.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "socket is not bound to an IP address")
    })
}

fn is_socket(fd: RawFd) -> bool {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat only writes into `stat`, and reports a closed or
    // invalid descriptor through its return value.
    let result = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if result != 0 {
        return false;
    }
    // SAFETY: a zero return means fstat filled the whole struct.
    let stat = unsafe { stat.assume_init() };
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
