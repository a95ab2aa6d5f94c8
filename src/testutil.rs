//! Loopback HTTP stub for exercising the token and Graph clients.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::mpsc::{channel, Receiver};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;

pub fn http_client() -> Client {
    Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[derive(Debug)]
pub struct CapturedRequest {
    pub head: Vec<String>,
    pub body: String
}

impl CapturedRequest {

    pub fn request_line(&self) -> String {
        // drop the HTTP version
        let line = &self.head[0];
        line.rsplit_once(' ').map(|(l, _)| l).unwrap_or(line).to_string()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head[1..].iter().find_map(|h| {
            let (key, value) = h.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

}

/// Answers exactly one request with a canned status and body.
pub struct HttpStub {
    port: u16,
    requests: Receiver<CapturedRequest>
}

impl HttpStub {

    pub fn serve(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let body = body.to_string();
        let (tx, requests) = channel();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut head = Vec::new();

            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();

                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                head.push(line);
            }

            let length = head
                .iter()
                .find_map(|h| {
                    let (key, value) = h.split_once(':')?;
                    key.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);

            let mut content = vec![0u8; length];
            reader.read_exact(&mut content).unwrap();

            tx.send(CapturedRequest { head, body: String::from_utf8_lossy(&content).into_owned() }).unwrap();

            let mut stream = stream;
            let response = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
        });

        Self { port, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn request(&self) -> CapturedRequest {
        self.requests.recv_timeout(Duration::from_secs(5)).unwrap()
    }

}
