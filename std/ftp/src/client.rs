//! [`Endpoint`] backed by a real FTP control connection via `suppaftp`.

use crate::endpoint::{
    ConnectParams, Connector, Endpoint, EndpointError, EndpointResult, ListFormat, PumpError,
    Reply, TransferControl, pump,
};
use std::io::{self, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs,
};
use std::time::{Duration, Instant};
use suppaftp::types::{FileType, Response};
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tracing::{debug, warn};

impl From<FtpError> for EndpointError {
    fn from(err: FtpError) -> Self {
        match err {
            FtpError::ConnectionError(e) => EndpointError::Connection(e),
            FtpError::UnexpectedResponse(resp) => {
                EndpointError::reply(resp.status.code(), reply_text(&resp.body))
            }
            other => EndpointError::BadResponse(other.to_string()),
        }
    }
}

/// Reply text without the leading status code and line terminator.
fn reply_text(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let bytes = text.as_bytes();
    if bytes.len() >= 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && matches!(bytes[3], b' ' | b'-')
    {
        text[4..].trim().to_string()
    } else {
        text.to_string()
    }
}

fn to_reply(resp: Response) -> Reply {
    Reply {
        code: resp.status.code(),
        text: reply_text(&resp.body),
    }
}

/// Data address from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv(text: &str) -> Option<SocketAddrV4> {
    text.split(|c: char| !c.is_ascii_digit() && c != ',')
        .find_map(|token| {
            let parts: Vec<u8> = token
                .split(',')
                .map(str::parse)
                .collect::<Result<_, _>>()
                .ok()?;
            match parts[..] {
                [a, b, c, d, p1, p2] => Some(SocketAddrV4::new(
                    Ipv4Addr::new(a, b, c, d),
                    u16::from(p1) << 8 | u16::from(p2),
                )),
                _ => None,
            }
        })
}

/// Argument of a `PORT` command announcing `addr`.
fn port_argument(addr: SocketAddrV4) -> String {
    let [a, b, c, d] = addr.ip().octets();
    let [p1, p2] = addr.port().to_be_bytes();
    format!("{a},{b},{c},{d},{p1},{p2}")
}

/// Wait up to `timeout` for the server to open an active-mode data connection.
fn accept_within(listener: &TcpListener, timeout: Duration) -> io::Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "server did not open the data connection",
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Data channel for `STOU`, opened before the command is sent.
enum UniqueChannel {
    Connected(TcpStream),
    Listening(TcpListener),
}

/// File name assigned by `STOU`, from replies such as `150 FILE: name`.
fn parse_unique_name(text: &str) -> Option<String> {
    let name = if let Some((_, rest)) = text.split_once("FILE:") {
        rest.split_whitespace().next()
    } else if let Some((_, rest)) = text.split_once('"') {
        rest.split('"').next()
    } else {
        text.split_whitespace().last()
    }?;
    let name = name.trim_matches(|c: char| matches!(c, '(' | ')' | '.' | ','));
    (!name.is_empty()).then(|| name.to_string())
}

/// Opens plain FTP connections with a fixed socket timeout.
#[derive(Debug, Clone)]
pub struct SuppaConnector {
    timeout: Duration,
}

impl SuppaConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connector for SuppaConnector {
    fn connect(&self, params: &ConnectParams) -> EndpointResult<Box<dyn Endpoint>> {
        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(EndpointError::Connection)?
            .next()
            .ok_or_else(|| {
                EndpointError::Connection(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", params.host),
                ))
            })?;
        let mut stream = FtpStream::connect_timeout(addr, self.timeout)?;
        let socket = stream.get_ref();
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(EndpointError::Connection)?;
        socket
            .set_write_timeout(Some(self.timeout))
            .map_err(EndpointError::Connection)?;
        let welcome = stream.get_welcome_msg().map(|m| reply_text(m.as_bytes()));
        stream.login(params.user.as_str(), params.password.as_str())?;
        stream.transfer_type(FileType::Binary)?;
        debug!(host = %params.host, port = params.port, user = %params.user, "ftp login ok");
        Ok(Box::new(SuppaEndpoint {
            stream,
            welcome,
            timeout: self.timeout,
            passive: true,
        }))
    }
}

struct SuppaEndpoint {
    stream: FtpStream,
    welcome: Option<String>,
    timeout: Duration,
    passive: bool,
}

impl SuppaEndpoint {
    fn abort_download<R: Read + 'static>(&mut self, data: R) {
        if let Err(err) = self.stream.abort(data) {
            warn!(error = %err, "ABOR after cancelled download failed");
        }
    }

    fn passive_channel(&mut self) -> EndpointResult<TcpStream> {
        let pasv = self.stream.custom_command("PASV", &[Status::PassiveMode])?;
        let pasv_text = reply_text(&pasv.body);
        let addr = parse_pasv(&pasv_text).ok_or_else(|| {
            EndpointError::BadResponse(format!("unparseable PASV reply: {pasv_text}"))
        })?;
        TcpStream::connect_timeout(&SocketAddr::V4(addr), self.timeout)
            .map_err(EndpointError::Connection)
    }

    fn active_listener(&mut self) -> EndpointResult<TcpListener> {
        let local = self
            .stream
            .get_ref()
            .local_addr()
            .map_err(EndpointError::Connection)?;
        let IpAddr::V4(ip) = local.ip() else {
            return Err(EndpointError::BadResponse(
                "active mode needs an IPv4 control connection".into(),
            ));
        };
        let listener = TcpListener::bind((ip, 0)).map_err(EndpointError::Connection)?;
        let port = listener
            .local_addr()
            .map_err(EndpointError::Connection)?
            .port();
        let command = format!("PORT {}", port_argument(SocketAddrV4::new(ip, port)));
        self.stream.custom_command(&command, &[Status::CommandOk])?;
        Ok(listener)
    }

    /// Close a cancelled upload and remove what reached the server.
    fn discard_upload<W: Write>(&mut self, path: &str, data: W) {
        if let Err(err) = self.stream.finalize_put_stream(data) {
            debug!(path, error = %err, "closing cancelled upload");
        }
        if let Err(err) = self.stream.rm(path) {
            warn!(path, error = %err, "could not remove partial upload");
        }
    }
}

impl Endpoint for SuppaEndpoint {
    fn welcome(&self) -> Option<String> {
        self.welcome.clone()
    }

    fn pwd(&mut self) -> EndpointResult<String> {
        Ok(self.stream.pwd()?)
    }

    fn cwd(&mut self, path: &str) -> EndpointResult<()> {
        Ok(self.stream.cwd(path)?)
    }

    fn cdup(&mut self) -> EndpointResult<()> {
        Ok(self.stream.cdup()?)
    }

    fn list(&mut self, path: Option<&str>, format: ListFormat) -> EndpointResult<Vec<String>> {
        let lines = match format {
            ListFormat::Long => self.stream.list(path)?,
            ListFormat::Names => self.stream.nlst(path)?,
            ListFormat::Machine => self.stream.mlsd(path)?,
        };
        Ok(lines)
    }

    fn retrieve(
        &mut self,
        path: &str,
        sink: &mut dyn Write,
        control: &TransferControl,
    ) -> EndpointResult<u64> {
        let mut data = self.stream.retr_as_stream(path)?;
        match pump(&mut data, sink, control) {
            Ok(n) => {
                self.stream.finalize_retr_stream(data)?;
                Ok(n)
            }
            Err(PumpError::Read(e)) => Err(EndpointError::Connection(e)),
            Err(PumpError::Write(e)) => {
                self.abort_download(data);
                Err(EndpointError::Local(e))
            }
            Err(PumpError::Aborted) => {
                self.abort_download(data);
                Err(EndpointError::Aborted)
            }
        }
    }

    fn store(
        &mut self,
        path: &str,
        source: &mut dyn Read,
        control: &TransferControl,
    ) -> EndpointResult<u64> {
        let mut data = self.stream.put_with_stream(path)?;
        match pump(source, &mut data, control) {
            Ok(n) => {
                self.stream.finalize_put_stream(data)?;
                Ok(n)
            }
            Err(PumpError::Write(e)) => Err(EndpointError::Connection(e)),
            Err(PumpError::Read(e)) => {
                self.discard_upload(path, data);
                Err(EndpointError::Local(e))
            }
            Err(PumpError::Aborted) => {
                self.discard_upload(path, data);
                Err(EndpointError::Aborted)
            }
        }
    }

    // suppaftp has no STOU helper, so the data channel is opened by hand.
    fn store_unique(
        &mut self,
        source: &mut dyn Read,
        control: &TransferControl,
    ) -> EndpointResult<String> {
        let channel = if self.passive {
            UniqueChannel::Connected(self.passive_channel()?)
        } else {
            UniqueChannel::Listening(self.active_listener()?)
        };

        let opened = self
            .stream
            .custom_command("STOU", &[Status::AboutToSend, Status::AlreadyOpen])?;
        let opened_text = reply_text(&opened.body);
        let name = parse_unique_name(&opened_text).ok_or_else(|| {
            EndpointError::BadResponse(format!("STOU reply names no file: {opened_text}"))
        })?;
        let mut data = match channel {
            UniqueChannel::Connected(stream) => stream,
            UniqueChannel::Listening(listener) => {
                accept_within(&listener, self.timeout).map_err(EndpointError::Connection)?
            }
        };
        data.set_write_timeout(Some(self.timeout))
            .map_err(EndpointError::Connection)?;

        match pump(source, &mut data, control) {
            Ok(_) => {
                self.stream.finalize_put_stream(data)?;
                Ok(name)
            }
            Err(PumpError::Write(e)) => Err(EndpointError::Connection(e)),
            Err(PumpError::Read(e)) => {
                self.discard_upload(&name, data);
                Err(EndpointError::Local(e))
            }
            Err(PumpError::Aborted) => {
                self.discard_upload(&name, data);
                Err(EndpointError::Aborted)
            }
        }
    }

    fn mkdir(&mut self, path: &str) -> EndpointResult<()> {
        Ok(self.stream.mkdir(path)?)
    }

    fn rmdir(&mut self, path: &str) -> EndpointResult<()> {
        Ok(self.stream.rmdir(path)?)
    }

    fn delete(&mut self, path: &str) -> EndpointResult<()> {
        Ok(self.stream.rm(path)?)
    }

    fn rename(&mut self, from: &str, to: &str) -> EndpointResult<()> {
        Ok(self.stream.rename(from, to)?)
    }

    fn size(&mut self, path: &str) -> EndpointResult<u64> {
        Ok(self.stream.size(path)? as u64)
    }

    fn command(&mut self, command: &str) -> EndpointResult<Reply> {
        match self.stream.custom_command(command, &[Status::CommandOk]) {
            Ok(resp) => Ok(to_reply(resp)),
            Err(FtpError::UnexpectedResponse(resp)) if resp.status.code() < 400 => {
                Ok(to_reply(resp))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn set_passive(&mut self, passive: bool) {
        self.passive = passive;
        self.stream
            .set_mode(if passive { Mode::Passive } else { Mode::Active });
    }

    fn quit(&mut self) -> EndpointResult<()> {
        Ok(self.stream.quit()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::client::{accept_within, parse_pasv, parse_unique_name, port_argument, reply_text};
    use std::io::{ErrorKind, Read, Write};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
    use std::time::Duration;

    #[test]
    fn pasv_reply_gives_data_address() {
        assert_eq!(
            parse_pasv("Entering Passive Mode (127,0,0,1,8,65)."),
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8 * 256 + 65))
        );
        assert_eq!(parse_pasv("Entering Passive Mode"), None);
        assert_eq!(parse_pasv("(300,0,0,1,1,1)"), None);
    }

    #[test]
    fn port_argument_splits_port_into_bytes() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 8 * 256 + 65);
        assert_eq!(port_argument(addr), "192,168,1,20,8,65");
        assert_eq!(
            parse_pasv(&format!("({})", port_argument(addr))),
            Some(addr)
        );
    }

    #[test]
    fn active_data_connection_is_accepted() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"payload").unwrap();
        });
        let mut data = accept_within(&listener, Duration::from_secs(5)).unwrap();
        let mut received = String::new();
        data.read_to_string(&mut received).unwrap();
        sender.join().unwrap();
        assert_eq!(received, "payload");
    }

    #[test]
    fn active_data_connection_times_out() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let err = accept_within(&listener, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn stou_reply_names() {
        assert_eq!(parse_unique_name("FILE: stou.8fa2").as_deref(), Some("stou.8fa2"));
        assert_eq!(
            parse_unique_name("Opening data connection for \"upload.1\"").as_deref(),
            Some("upload.1")
        );
        assert_eq!(parse_unique_name("Storing as abc123.").as_deref(), Some("abc123"));
        assert_eq!(parse_unique_name(""), None);
    }

    #[test]
    fn reply_code_is_stripped() {
        assert_eq!(reply_text(b"550 No such file or directory.\r\n"), "No such file or directory.");
        assert_eq!(reply_text(b"220-Welcome"), "Welcome");
        assert_eq!(reply_text(b"plain"), "plain");
    }
}
