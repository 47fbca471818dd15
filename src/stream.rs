use std::io::{Error, ErrorKind, Read, Result, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

#[cfg(feature = "ssl")]
use openssl::ssl::{
    Ssl, SslContext, SslMethod, SslStream, SslOptions, SslVerifyMode, SslFiletype,
};

/// Encapsulates how to reach the server: plain TCP or TLS.
#[derive(Clone)]
pub enum ConnectMethod {
    /// Connect to the server through a regular TCP stream.
    Tcp,
    #[cfg(feature = "ssl")]
    /// Connect to the server through a TCP stream encrypted with SSL.
    Ssl {
        ca_file: String,
        certificate_file: String,
        key_file: String,
        verify_peer: bool,
    },
}

/// Encapsulates the functionality for how to connect to the server,
/// including the timeouts bounding socket establishment and each
/// send/receive.
#[derive(Clone)]
pub struct StreamConnector {
    /// Bounds establishment of the TCP connection.
    pub connect_timeout: Option<Duration>,
    /// Bounds every read and write on the established socket.
    pub socket_timeout: Option<Duration>,
    method: ConnectMethod,
}

impl Default for StreamConnector {
    fn default() -> Self {
        StreamConnector {
            connect_timeout: None,
            socket_timeout: None,
            method: ConnectMethod::Tcp,
        }
    }
}

impl StreamConnector {
    pub fn new() -> StreamConnector {
        Default::default()
    }

    #[cfg(feature = "ssl")]
    /// Creates a StreamConnector that will connect with SSL encryption.
    ///
    /// # Arguments
    ///
    /// `ca_file` - Path to the file containing trusted CA certificates.
    /// `certificate_file` - Path to the file containing the client certificate.
    /// `key_file` - Path to the file containing the client private key.
    /// `verify_peer` - Whether or not to verify that the server's certificate is trusted.
    pub fn with_ssl(
        ca_file: &str,
        certificate_file: &str,
        key_file: &str,
        verify_peer: bool,
    ) -> Self {
        StreamConnector {
            connect_timeout: None,
            socket_timeout: None,
            method: ConnectMethod::Ssl {
                ca_file: String::from(ca_file),
                certificate_file: String::from(certificate_file),
                key_file: String::from(key_file),
                verify_peer,
            },
        }
    }

    pub fn connect(&self, hostname: &str, port: u16) -> Result<Stream> {
        let tcp_stream = self.connect_tcp(hostname, port)?;
        tcp_stream.set_read_timeout(self.socket_timeout)?;
        tcp_stream.set_write_timeout(self.socket_timeout)?;

        match self.method {
            ConnectMethod::Tcp => Ok(Stream::Tcp(tcp_stream)),
            #[cfg(feature = "ssl")]
            ConnectMethod::Ssl {
                ref ca_file,
                ref certificate_file,
                ref key_file,
                verify_peer,
            } => {
                let mut ssl_context = SslContext::builder(SslMethod::tls())?;
                ssl_context.set_cipher_list("ALL:!EXPORT:!eNULL:!aNULL:HIGH:@STRENGTH")?;
                ssl_context.set_options(SslOptions::NO_SSLV2);
                ssl_context.set_options(SslOptions::NO_SSLV3);
                ssl_context.set_options(SslOptions::NO_COMPRESSION);
                ssl_context.set_ca_file(ca_file)?;
                ssl_context.set_certificate_file(certificate_file, SslFiletype::PEM)?;
                ssl_context.set_private_key_file(key_file, SslFiletype::PEM)?;

                let verify = if verify_peer {
                    SslVerifyMode::PEER
                } else {
                    SslVerifyMode::NONE
                };
                ssl_context.set_verify(verify);

                let mut ssl = Ssl::new(&ssl_context.build())?;
                ssl.set_hostname(hostname)?;

                match ssl.connect(tcp_stream) {
                    Ok(s) => Ok(Stream::Ssl(s)),
                    Err(e) => Err(Error::new(ErrorKind::Other, e)),
                }
            }
        }
    }

    fn connect_tcp(&self, hostname: &str, port: u16) -> Result<TcpStream> {
        match self.connect_timeout {
            Some(timeout) => {
                let address = (hostname, port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        Error::new(
                            ErrorKind::AddrNotAvailable,
                            format!("Could not resolve '{}:{}'.", hostname, port),
                        )
                    })?;
                TcpStream::connect_timeout(&address, timeout)
            }
            None => TcpStream::connect((hostname, port)),
        }
    }
}

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "ssl")]
    Ssl(SslStream<TcpStream>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.read(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.write(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match *self {
            Stream::Tcp(ref mut s) => s.flush(),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.flush(),
        }
    }
}

impl Stream {
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match *self {
            Stream::Tcp(ref stream) => stream.peer_addr(),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref stream) => stream.get_ref().peer_addr(),
        }
    }
}
