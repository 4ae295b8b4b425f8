//! Scripted TCP server for command tests: accepts connections, records
//! every request frame it reads and answers from a fixed response queue.

use crate::commands::buffer::Buffer;
use crate::commands::buffer::{self, INFO3_LAST};
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::cluster::{Cluster, Node, NodeFeatures};
use crate::net::Host;
use crate::policy::ClientPolicy;

/// A scripted response. `Hold` keeps the connection open without
/// answering, to provoke client-side socket deadlines.
pub(crate) enum Script {
    Reply(Vec<u8>),
    Hold,
}

pub(crate) struct MockServer {
    pub host: Host,
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockServer {
    /// Spawn a server answering with `scripts` in order, one per request
    /// frame, across however many connections the client opens.
    pub fn start(scripts: Vec<Script>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().unwrap().port();
        let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let scripts = Arc::new(Mutex::new(scripts.into_iter().collect::<VecDeque<_>>()));

        {
            let requests = requests.clone();
            thread::spawn(move || loop {
                if scripts.lock().unwrap().is_empty() {
                    break;
                }
                let (mut stream, _) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                loop {
                    let mut head = [0u8; 8];
                    if stream.read_exact(&mut head).is_err() {
                        break;
                    }
                    let size = (BigEndian::read_u64(&head) & 0x0000_FFFF_FFFF_FFFF) as usize;
                    let mut body = vec![0u8; size];
                    if stream.read_exact(&mut body).is_err() {
                        break;
                    }
                    let mut frame = head.to_vec();
                    frame.extend_from_slice(&body);
                    requests.lock().unwrap().push(frame);

                    let script = scripts.lock().unwrap().pop_front();
                    match script {
                        Some(Script::Reply(reply)) => {
                            if stream.write_all(&reply).is_err() {
                                break;
                            }
                        }
                        Some(Script::Hold) => {
                            thread::sleep(Duration::from_millis(500));
                            break;
                        }
                        None => break,
                    }
                }
            });
        }

        MockServer {
            host: Host::new("127.0.0.1", port),
            requests,
        }
    }

    pub fn request(&self, index: usize) -> Vec<u8> {
        self.requests.lock().unwrap()[index].clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// One-node cluster pointed at a mock server.
pub(crate) fn mock_cluster(server: &MockServer) -> Arc<Cluster> {
    mock_cluster_with(server, NodeFeatures::default())
}

pub(crate) fn mock_cluster_with(server: &MockServer, features: NodeFeatures) -> Arc<Cluster> {
    let cluster = Cluster::new(ClientPolicy::default(), None);
    let node = Node::new(
        "mock-0".to_string(),
        server.host.clone(),
        features,
        &ClientPolicy::default(),
        None,
    )
    .unwrap();
    cluster.add_node(Arc::new(node));
    Arc::new(cluster)
}

fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let size = body.len() as u64
        | (u64::from(buffer::PROTO_VERSION) << 56)
        | (u64::from(buffer::PROTO_TYPE_AS_MSG) << 48);
    out.write_u64::<BigEndian>(size).unwrap();
    out.extend_from_slice(&body);
    out
}

fn row_header(
    info3: u8,
    result_code: u8,
    generation: u32,
    expiration: u32,
    batch_index: u32,
    n_fields: u16,
    n_ops: u16,
) -> Vec<u8> {
    let mut row = Vec::with_capacity(22);
    row.write_u8(22).unwrap();
    row.write_u8(0).unwrap();
    row.write_u8(0).unwrap();
    row.write_u8(info3).unwrap();
    row.write_u8(0).unwrap();
    row.write_u8(result_code).unwrap();
    row.write_u32::<BigEndian>(generation).unwrap();
    row.write_u32::<BigEndian>(expiration).unwrap();
    row.write_u32::<BigEndian>(batch_index).unwrap();
    row.write_u16::<BigEndian>(n_fields).unwrap();
    row.write_u16::<BigEndian>(n_ops).unwrap();
    row
}

fn bin_op(name: &str, value: &Value) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.data_offset = 0;
    let particle_size = value.estimate_size();
    buffer.write_u32((4 + name.len() + particle_size) as u32);
    buffer.write_u8(1); // read op
    buffer.write_u8(value.particle_type() as u8);
    buffer.write_u8(0);
    buffer.write_u8(name.len() as u8);
    buffer.write_str(name);
    value.write_to(&mut buffer).unwrap();
    buffer.data_buffer[..buffer.data_offset].to_vec()
}

fn field(field_type: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + data.len());
    out.write_u32::<BigEndian>(data.len() as u32 + 1).unwrap();
    out.write_u8(field_type).unwrap();
    out.extend_from_slice(data);
    out
}

/// Complete single-record response frame.
pub(crate) fn single_response(
    result_code: u8,
    generation: u32,
    expiration: u32,
    bins: &[(&str, Value)],
) -> Vec<u8> {
    single_response_with_fields(result_code, generation, expiration, &[], bins)
}

pub(crate) fn single_response_with_fields(
    result_code: u8,
    generation: u32,
    expiration: u32,
    fields: &[(u8, Vec<u8>)],
    bins: &[(&str, Value)],
) -> Vec<u8> {
    let mut body = row_header(
        0,
        result_code,
        generation,
        expiration,
        0,
        fields.len() as u16,
        bins.len() as u16,
    );
    for (field_type, data) in fields {
        body.extend_from_slice(&field(*field_type, data));
    }
    for (name, value) in bins {
        body.extend_from_slice(&bin_op(name, value));
    }
    frame(body)
}

/// Multi-record response frame from batch-style rows plus the end marker.
pub(crate) fn stream_response(rows: Vec<Vec<u8>>) -> Vec<u8> {
    let mut body = Vec::new();
    for row in rows {
        body.extend_from_slice(&row);
    }
    body.extend_from_slice(&row_header(INFO3_LAST, 0, 0, 0, 0, 0, 0));
    frame(body)
}

/// Found row of a batch response, echoing the entry's offset.
pub(crate) fn batch_row(batch_index: u32, digest: &[u8; 20], bins: &[(&str, Value)]) -> Vec<u8> {
    let mut row = row_header(0, 0, 1, 0, batch_index, 1, bins.len() as u16);
    row.extend_from_slice(&field(4, digest)); // digest field
    for (name, value) in bins {
        row.extend_from_slice(&bin_op(name, value));
    }
    row
}

/// Scan row carrying namespace, set and digest.
pub(crate) fn scan_row(
    namespace: &str,
    set_name: &str,
    digest: &[u8; 20],
    bins: &[(&str, Value)],
) -> Vec<u8> {
    let mut row = row_header(0, 0, 1, 0, 0, 3, bins.len() as u16);
    row.extend_from_slice(&field(0, namespace.as_bytes()));
    row.extend_from_slice(&field(1, set_name.as_bytes()));
    row.extend_from_slice(&field(4, digest));
    for (name, value) in bins {
        row.extend_from_slice(&bin_op(name, value));
    }
    row
}

/// Re-wrap a plain response frame in the compressed envelope.
pub(crate) fn compressed(plain_frame: Vec<u8>) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let body = &plain_frame[8..];
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).unwrap();
    let deflated = encoder.finish().unwrap();

    let mut out = Vec::with_capacity(deflated.len() + 16);
    let size = (deflated.len() + 8) as u64
        | (u64::from(buffer::PROTO_VERSION) << 56)
        | (u64::from(buffer::PROTO_TYPE_COMPRESSED) << 48);
    out.write_u64::<BigEndian>(size).unwrap();
    out.write_u64::<BigEndian>(body.len() as u64).unwrap();
    out.extend_from_slice(&deflated);
    out
}

/// Multi-record frame whose only row aborts the stream with an error.
pub(crate) fn error_row_response(result_code: u8) -> Vec<u8> {
    frame(row_header(0, result_code, 0, 0, 0, 0, 0))
}

/// Admin response with a status byte only.
pub(crate) fn admin_status_response(result_code: u8) -> Vec<u8> {
    admin_frame(vec![0, result_code, 0, 0])
}

/// Wrap raw admin records in the admin proto framing.
pub(crate) fn admin_frame(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let size = body.len() as u64
        | (u64::from(buffer::PROTO_VERSION) << 56)
        | (u64::from(buffer::PROTO_TYPE_ADMIN) << 48);
    out.write_u64::<BigEndian>(size).unwrap();
    out.extend_from_slice(&body);
    out
}

/// Info response with raw text payload.
pub(crate) fn info_response(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 8);
    let size = text.len() as u64
        | (u64::from(buffer::PROTO_VERSION) << 56)
        | (u64::from(buffer::PROTO_TYPE_INFO) << 48);
    out.write_u64::<BigEndian>(size).unwrap();
    out.extend_from_slice(text.as_bytes());
    out
}
