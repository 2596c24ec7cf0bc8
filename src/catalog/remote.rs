//! Remote catalog proxy — the same read operations over HTTP.
//!
//! Session initiation is `POST /login` with form fields `host` and optional
//! `token`; the server answers with a session cookie the agent carries from
//! then on.  Every read maps to `GET /<operation>/<args…>` returning the JSON
//! encoding of the local operation's result (`null` for a missing row), and
//! `GET /getFileData/<digest>` streams raw blob bytes.  Any non-2xx response
//! maps to [`Error::Remote`].

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::cache::BlobSource;
use crate::catalog::types::{ChecksumInfo, FileRecord, NodeId, SnapshotInfo};
use crate::catalog::CatalogRead;
use crate::error::{Error, Result};

/// Spool threshold for blob downloads; larger bodies go to a temp file.
const SPOOL_MAX: usize = 16 * 1024 * 1024;

pub struct RemoteCatalog {
    agent:    ureq::Agent,
    base_url: String,
}

impl RemoteCatalog {
    /// Open a session against a remote catalog server.
    pub fn login(url: &str, host: &str, token: Option<&str>) -> Result<Self> {
        let base_url = if url.ends_with('/') {
            url.to_owned()
        } else {
            format!("{url}/")
        };
        let agent = ureq::AgentBuilder::new().build();
        let mut form: Vec<(&str, &str)> = vec![("host", host)];
        if let Some(t) = token {
            form.push(("token", t));
        }
        agent
            .post(&format!("{base_url}login"))
            .send_form(&form)
            .map_err(remote_err)?;
        Ok(Self { agent, base_url })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, op_and_args: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, op_and_args);
        let resp = self.agent.get(&url).call().map_err(remote_err)?;
        resp.into_json::<T>()
            .map_err(|e| Error::Remote(format!("decoding {op_and_args}: {e}")))
    }
}

fn remote_err(e: ureq::Error) -> Error {
    Error::Remote(e.to_string())
}

/// Percent-encode one path segment (names may contain any byte once
/// encrypted-and-base64'd, including `/` and `+`).
fn urlencode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

impl CatalogRead for RemoteCatalog {
    fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.get_json("listBackupSets")
    }

    fn last_snapshot(&self, completed_only: bool) -> Result<Option<SnapshotInfo>> {
        self.get_json(&format!("lastBackupSet/{}", completed_only as u8))
    }

    fn snapshot_by_name(&self, name: &str) -> Result<Option<SnapshotInfo>> {
        self.get_json(&format!("getBackupSetInfo/{}", urlencode(name)))
    }

    fn snapshot_for_time(&self, t: i64) -> Result<Option<SnapshotInfo>> {
        self.get_json(&format!("getBackupSetForTime/{t}"))
    }

    fn file_by_name(&self, name: &str, parent: NodeId, bset: i64) -> Result<Option<FileRecord>> {
        self.get_json(&format!(
            "getFileInfoByName/{bset}/{}/{}/{}",
            parent.1,
            parent.0,
            urlencode(name)
        ))
    }

    fn file_by_inode(&self, node: NodeId, bset: i64) -> Result<Option<FileRecord>> {
        self.get_json(&format!("getFileInfoByInode/{bset}/{}/{}", node.1, node.0))
    }

    fn read_directory(&self, node: NodeId, bset: i64) -> Result<Vec<FileRecord>> {
        self.get_json(&format!("readDirectory/{bset}/{}/{}", node.1, node.0))
    }

    fn checksum_info(&self, digest: &str) -> Result<Option<ChecksumInfo>> {
        self.get_json(&format!("getChecksumInfo/{}", urlencode(digest)))
    }

    fn names_for_checksum(&self, digest: &str) -> Result<Vec<String>> {
        self.get_json(&format!("getNamesForChecksum/{}", urlencode(digest)))
    }

    fn file_by_path(&self, path: &Path, bset: i64) -> Result<Option<FileRecord>> {
        let joined = crate::catalog::splitpath(path)
            .iter()
            .map(|c| urlencode(c))
            .collect::<Vec<_>>()
            .join("/");
        self.get_json(&format!("getFileInfoByPath/{bset}/{joined}"))
    }
}

impl BlobSource for RemoteCatalog {
    /// Stream the blob body into a spooled temp file so the regenerator gets
    /// a rewindable source.
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read>> {
        let url = format!("{}getFileData/{}", self.base_url, urlencode(digest));
        let resp = self.agent.get(&url).call().map_err(remote_err)?;
        let mut body = resp.into_reader();
        let mut spool = tempfile::SpooledTempFile::new(SPOOL_MAX);
        std::io::copy(&mut body, &mut spool).map_err(|e| Error::io(digest, e))?;
        spool.seek(SeekFrom::Start(0)).map_err(|e| Error::io(digest, e))?;
        Ok(Box::new(spool))
    }

    fn blob_exists(&self, digest: &str) -> bool {
        matches!(self.checksum_info(digest), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    /// One-shot HTTP stub: answers each accepted connection from a canned
    /// routing table until the listener is dropped.
    fn serve(routes: Vec<(&'static str, String)>) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                // Consume the whole request (headers + declared body) so the
                // close below cannot reset the client mid-write.
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];
                let mut header_end: Option<usize> = None;
                let mut content_length = 0usize;
                loop {
                    let n = stream.read(&mut tmp).unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                    if header_end.is_none() {
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            header_end = Some(pos + 4);
                            let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                            content_length = head
                                .lines()
                                .find_map(|l| l.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse().ok())
                                .unwrap_or(0);
                        }
                    }
                    if let Some(end) = header_end {
                        if buf.len() >= end + content_length {
                            break;
                        }
                    }
                }
                let req = String::from_utf8_lossy(&buf).into_owned();
                let path = req.split_whitespace().nth(1).unwrap_or("/").to_owned();

                let body = routes
                    .iter()
                    .find(|(prefix, _)| path.starts_with(prefix))
                    .map(|(_, body)| body.clone());
                let resp = match body {
                    Some(body) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    ),
                    None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_owned(),
                };
                let _ = stream.write_all(resp.as_bytes());
                if path == "/stop" {
                    break;
                }
            }
        });
        (format!("http://{addr}"), handle)
    }

    fn stop(base: &str, handle: std::thread::JoinHandle<()>) {
        let _ = ureq::get(&format!("{base}/stop")).call();
        let _ = handle.join();
    }

    #[test]
    fn login_and_json_round_trip() {
        let snapshot = SnapshotInfo {
            bset_id: 7,
            name: "weekly".into(),
            session: "sess".into(),
            start_time: 100,
            end_time: Some(200),
            client_time: None,
            completed: true,
            priority: 1,
        };
        let (base, handle) = serve(vec![
            ("/login", "{}".into()),
            ("/lastBackupSet/1", serde_json::to_string(&snapshot).unwrap()),
            ("/getChecksumInfo/", "null".into()),
            ("/stop", "{}".into()),
        ]);

        let remote = RemoteCatalog::login(&base, "client-a", Some("tok")).unwrap();
        let last = remote.last_snapshot(true).unwrap().unwrap();
        assert_eq!(last.bset_id, 7);
        assert_eq!(last.name, "weekly");
        assert!(remote.checksum_info("deadbeef").unwrap().is_none());
        stop(&base, handle);
    }

    #[test]
    fn blob_download_is_rewound() {
        let (base, handle) = serve(vec![
            ("/login", "{}".into()),
            ("/getFileData/abc", "blob-bytes".into()),
            ("/stop", "{}".into()),
        ]);
        let remote = RemoteCatalog::login(&base, "client-a", None).unwrap();
        let mut out = Vec::new();
        remote.open_blob("abc").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"blob-bytes");
        stop(&base, handle);
    }

    #[test]
    fn non_2xx_maps_to_remote_error() {
        let (base, handle) = serve(vec![("/login", "{}".into()), ("/stop", "{}".into())]);
        let remote = RemoteCatalog::login(&base, "client-a", None).unwrap();
        assert!(matches!(
            remote.list_snapshots(),
            Err(Error::Remote(_))
        ));
        stop(&base, handle);
    }

    #[test]
    fn urlencode_escapes_base64_names() {
        assert_eq!(urlencode("ab/cd+e="), "ab%2Fcd%2Be%3D");
        assert_eq!(urlencode("plain-name_1.txt"), "plain-name_1.txt");
    }
}
