//! SOCKS5 CONNECT handshake.
//!
//! Runs on an already-connected stream before the caller sees it. The
//! exchange is the no-auth subset:
//!
//! ```text
//! >> 05 01 00                          greeting: version 5, one method, NO_AUTH
//! << 05 00                             method accepted
//! >> 05 01 00 <atyp> <addr> <port>     CONNECT to the requested endpoint
//! << 05 00 00 <atyp> <bnd> <port>      success (rep != 0 is a proxy error)
//! ```
//!
//! Each exchange stage is an explicit step function; bytes received past
//! the final reply are handed back to the stream for the first
//! application read.

use super::connect::ConnectSettings;
use super::stream::StreamTransport;
use super::ConnectCallback;
use crate::error::{Error, ErrorKind};
use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

struct Handshake {
    stream: StreamTransport,
    host: String,
    port: u16,
    buf: Vec<u8>,
    callback: Option<ConnectCallback>,
}

/// Runs the handshake, then delivers the stream (or a connection-class
/// error) to the connect callback.
pub(crate) fn handshake(
    stream: StreamTransport,
    settings: &ConnectSettings,
    callback: ConnectCallback,
) {
    tracing::debug!(host = %settings.address, port = settings.port, "socks5 handshake");
    let state = Rc::new(RefCell::new(Handshake {
        stream,
        host: settings.address.clone(),
        port: settings.port,
        buf: Vec::new(),
        callback: Some(callback),
    }));
    send_greeting(&state);
}

fn send_greeting(state: &Rc<RefCell<Handshake>>) {
    let stream = state.borrow().stream.clone();
    let rc = Rc::clone(state);
    stream.write(vec![VERSION, 1, METHOD_NO_AUTH], move |result| {
        match result {
            Ok(()) => await_method(&rc),
            Err(err) => fail(&rc, err),
        }
    });
}

fn await_method(state: &Rc<RefCell<Handshake>>) {
    let stream = state.borrow().stream.clone();
    let rc = Rc::clone(state);
    stream.read(move |result| match result {
        Ok(chunk) => {
            let have = {
                let mut me = rc.borrow_mut();
                me.buf.extend_from_slice(&chunk);
                me.buf.len()
            };
            if have < 2 {
                await_method(&rc);
                return;
            }
            let accepted = {
                let me = rc.borrow();
                me.buf[0] == VERSION && me.buf[1] == METHOD_NO_AUTH
            };
            if accepted {
                rc.borrow_mut().buf.drain(0..2);
                send_request(&rc);
            } else {
                fail(
                    &rc,
                    Error::new(ErrorKind::ConnectionFailed, "socks5 method rejected"),
                );
            }
        }
        Err(err) => fail(&rc, err),
    });
}

fn send_request(state: &Rc<RefCell<Handshake>>) {
    let request = {
        let me = state.borrow();
        let mut out = vec![VERSION, CMD_CONNECT, 0];
        match me.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if me.host.len() > 255 {
                    drop(me);
                    fail(
                        state,
                        Error::new(ErrorKind::InvalidInput, "socks5 domain too long"),
                    );
                    return;
                }
                out.push(ATYP_DOMAIN);
                out.push(me.host.len() as u8);
                out.extend_from_slice(me.host.as_bytes());
            }
        }
        out.extend_from_slice(&me.port.to_be_bytes());
        out
    };
    let stream = state.borrow().stream.clone();
    let rc = Rc::clone(state);
    stream.write(request, move |result| match result {
        Ok(()) => await_reply(&rc),
        Err(err) => fail(&rc, err),
    });
}

/// Reply length once the address type is known, or `None` while the
/// fixed prefix is still incomplete.
fn reply_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    match buf[3] {
        ATYP_IPV4 => Some(4 + 4 + 2),
        ATYP_IPV6 => Some(4 + 16 + 2),
        ATYP_DOMAIN => Some(4 + 1 + buf[4] as usize + 2),
        _ => Some(0), // Invalid; caught by the version/reply check.
    }
}

fn await_reply(state: &Rc<RefCell<Handshake>>) {
    let stream = state.borrow().stream.clone();
    let rc = Rc::clone(state);
    stream.read(move |result| match result {
        Ok(chunk) => {
            {
                let mut me = rc.borrow_mut();
                me.buf.extend_from_slice(&chunk);
            }
            let me = rc.borrow();
            let Some(total) = reply_len(&me.buf) else {
                drop(me);
                await_reply(&rc);
                return;
            };
            if total == 0 || me.buf[0] != VERSION {
                drop(me);
                fail(
                    &rc,
                    Error::new(ErrorKind::ConnectionFailed, "socks5 malformed reply"),
                );
                return;
            }
            if me.buf[1] != 0 {
                let rep = i32::from(me.buf[1]);
                drop(me);
                fail(
                    &rc,
                    Error::with_raw(ErrorKind::ConnectionFailed, "socks5 connect refused", rep),
                );
                return;
            }
            if me.buf.len() < total {
                drop(me);
                await_reply(&rc);
                return;
            }
            drop(me);
            succeed(&rc, total);
        }
        Err(err) => fail(&rc, err),
    });
}

fn succeed(state: &Rc<RefCell<Handshake>>, reply_total: usize) {
    let mut me = state.borrow_mut();
    let leftover = me.buf.split_off(reply_total);
    let stream = me.stream.clone();
    let callback = me.callback.take().expect("handshake completes once");
    drop(me);
    stream.unread(leftover);
    tracing::debug!("socks5 handshake complete");
    callback(Ok(stream));
}

fn fail(state: &Rc<RefCell<Handshake>>, err: Error) {
    let mut me = state.borrow_mut();
    let stream = me.stream.clone();
    let callback = me.callback.take().expect("handshake completes once");
    drop(me);
    stream.close();
    tracing::debug!(error = %err, "socks5 handshake failed");
    callback(Err(err));
}
