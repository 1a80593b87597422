//! TCP mesh between the processes of a cluster.
//!
//! Each process connects to every process with a lower identity and accepts
//! a connection from every process with a higher one, identifying itself
//! with its process index on connect. One send thread and one receive
//! thread per remote process move framed, bincode-encoded messages; frames
//! carry `[source u32 | target u32 | length u32]` headers.

use std::io::{BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use crate::allocator::{forward, Endpoint, Event, PeerSender};
use crate::{ExchangeData, QUEUE_CAPACITY};

/// Creates socket connections from a list of process addresses.
///
/// The result holds one stream per process, `None` at this process's own
/// index.
pub fn create_sockets(
    addresses: Vec<String>,
    my_index: usize,
) -> Result<Vec<Option<TcpStream>>, String> {
    let hosts1 = Arc::new(addresses);
    let hosts2 = Arc::clone(&hosts1);

    let start_task = thread::spawn(move || start_connections(&hosts1, my_index));
    let await_task = thread::spawn(move || await_connections(&hosts2, my_index));

    let mut results = start_task.join().map_err(|_| "connect thread panicked")??;
    results.push(None);
    results.extend(await_task.join().map_err(|_| "accept thread panicked")??);

    tracing::info!(process = my_index, "cluster handshake complete");
    Ok(results)
}

/// Connections to processes `0 .. my_index`, retrying until each accepts.
fn start_connections(
    addresses: &[String],
    my_index: usize,
) -> Result<Vec<Option<TcpStream>>, String> {
    let mut results = Vec::with_capacity(my_index);
    for index in 0..my_index {
        loop {
            match TcpStream::connect(&addresses[index][..]) {
                Ok(mut stream) => {
                    stream.set_nodelay(true).map_err(|e| e.to_string())?;
                    stream
                        .write_u64::<NetworkEndian>(my_index as u64)
                        .map_err(|e| format!("error identifying to process {}: {}", index, e))?;
                    results.push(Some(stream));
                    tracing::debug!(process = my_index, peer = index, "connected");
                    break;
                }
                Err(error) => {
                    tracing::debug!(
                        process = my_index,
                        peer = index,
                        %error,
                        "connection refused; retrying"
                    );
                    thread::sleep(Duration::from_millis(500));
                }
            }
        }
    }
    Ok(results)
}

/// Connections from processes `my_index + 1 ..`, in whatever order they dial.
fn await_connections(
    addresses: &[String],
    my_index: usize,
) -> Result<Vec<Option<TcpStream>>, String> {
    let mut results: Vec<Option<TcpStream>> =
        (my_index + 1..addresses.len()).map(|_| None).collect();
    let listener = TcpListener::bind(&addresses[my_index][..])
        .map_err(|e| format!("error binding {}: {}", addresses[my_index], e))?;

    for _ in my_index + 1..addresses.len() {
        let mut stream = listener.accept().map_err(|e| e.to_string())?.0;
        stream.set_nodelay(true).map_err(|e| e.to_string())?;
        let identity = stream
            .read_u64::<NetworkEndian>()
            .map_err(|e| format!("error reading peer identity: {}", e))? as usize;
        if identity <= my_index || identity >= addresses.len() {
            return Err(format!("peer announced invalid process identity {}", identity));
        }
        results[identity - my_index - 1] = Some(stream);
        tracing::debug!(process = my_index, peer = identity, "accepted");
    }
    Ok(results)
}

/// Builds endpoints for this process's workers, wired to local peers through
/// channels and to remote peers through the socket mesh.
pub fn cluster_endpoints<T: ExchangeData>(
    threads: usize,
    process: usize,
    addresses: Vec<String>,
) -> Result<Vec<Endpoint<T>>, String> {
    let processes = addresses.len();
    let peers = threads * processes;
    let first_worker = threads * process;
    let sockets = create_sockets(addresses, process)?;

    // Inbound queue per local worker.
    let mut local_txs = Vec::with_capacity(threads);
    let mut local_rxs = Vec::with_capacity(threads);
    for _ in 0..threads {
        let (tx, rx) = sync_channel(QUEUE_CAPACITY);
        local_txs.push(tx);
        local_rxs.push(rx);
    }

    // One uplink per remote process; `None` at our own slot.
    let mut uplinks: Vec<Option<SyncSender<(usize, usize, T)>>> = Vec::with_capacity(processes);
    for (remote, socket) in sockets.into_iter().enumerate() {
        let Some(socket) = socket else {
            uplinks.push(None);
            continue;
        };
        let reader = socket.try_clone().map_err(|e| e.to_string())?;

        let (uplink_tx, uplink_rx) = sync_channel::<(usize, usize, T)>(QUEUE_CAPACITY);
        uplinks.push(Some(uplink_tx));

        thread::Builder::new()
            .name(format!("freshet-send-{}-{}", process, remote))
            .spawn(move || send_loop(socket, uplink_rx))
            .map_err(|e| e.to_string())?;

        let queue_txs = local_txs.clone();
        thread::Builder::new()
            .name(format!("freshet-recv-{}-{}", process, remote))
            .spawn(move || recv_loop::<T>(reader, remote, first_worker, queue_txs))
            .map_err(|e| e.to_string())?;
    }

    // Sender table over all global workers, shared by the local endpoints.
    let mut senders = Vec::with_capacity(peers);
    for target in 0..peers {
        let owner = target / threads;
        if owner == process {
            senders.push(PeerSender::Local(local_txs[target - first_worker].clone()));
        } else {
            let uplink = uplinks[owner].as_ref().expect("uplink for remote process").clone();
            senders.push(PeerSender::Remote { target, uplink });
        }
    }

    Ok(local_rxs
        .into_iter()
        .enumerate()
        .map(|(local, rx)| Endpoint::new(first_worker + local, peers, senders.clone(), rx))
        .collect())
}

fn send_loop<T: ExchangeData>(
    socket: TcpStream,
    uplink: std::sync::mpsc::Receiver<(usize, usize, T)>,
) {
    let mut writer = BufWriter::new(socket);
    while let Ok((source, target, payload)) = uplink.recv() {
        let bytes = match bincode::serialize(&payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(%error, "error encoding outbound frame; closing uplink");
                break;
            }
        };
        let ok = writer
            .write_u32::<NetworkEndian>(source as u32)
            .and_then(|_| writer.write_u32::<NetworkEndian>(target as u32))
            .and_then(|_| writer.write_u32::<NetworkEndian>(bytes.len() as u32))
            .and_then(|_| writer.write_all(&bytes))
            .and_then(|_| writer.flush());
        if let Err(error) = ok {
            tracing::warn!(%error, "error writing to peer; closing uplink");
            break;
        }
    }
    if let Ok(socket) = writer.into_inner() {
        let _ = socket.shutdown(std::net::Shutdown::Write);
    }
}

fn recv_loop<T: ExchangeData>(
    mut socket: TcpStream,
    remote: usize,
    first_worker: usize,
    queues: Vec<SyncSender<Event<T>>>,
) {
    loop {
        let source = match socket.read_u32::<NetworkEndian>() {
            Ok(v) => v as usize,
            // EOF here is the peer's normal shutdown; workers that have not
            // finished their protocol treat the event as fatal.
            Err(_) => break,
        };
        let (target, length) = match (
            socket.read_u32::<NetworkEndian>(),
            socket.read_u32::<NetworkEndian>(),
        ) {
            (Ok(t), Ok(l)) => (t as usize, l as usize),
            _ => break,
        };
        let mut buffer = vec![0u8; length];
        if socket.read_exact(&mut buffer).is_err() {
            break;
        }
        let payload: T = match bincode::deserialize(&buffer) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(%error, "malformed frame from process {}", remote);
                break;
            }
        };
        let local = match target.checked_sub(first_worker) {
            Some(local) if local < queues.len() => local,
            _ => {
                tracing::error!(target, "frame addressed to worker not hosted here");
                break;
            }
        };
        if !forward(&queues[local], Event::Message { source, payload }) {
            // Worker is gone; stop reading on its behalf.
            break;
        }
    }
    for queue in &queues {
        let _ = queue.try_send(Event::Disconnected { process: remote });
    }
}
