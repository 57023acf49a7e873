use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};

// ── Record framing ────────────────────────────────────────────────

/// Length prefix plus CRC trailer around every payload.
const FRAME_OVERHEAD: u64 = 8;

/// `[u32 len][bincode payload][u32 crc32]`, little endian. Returns the bytes written.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(FRAME_OVERHEAD + u64::from(len))
}

/// Fill `buf`, or report a clean/torn end of file as `Ok(false)`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record and its framed size, or `None` at end of log, a torn
/// tail, or a CRC mismatch.
///
/// A record whose CRC matches but whose payload does not decode is an error:
/// it was written whole, so dropping it would silently lose history.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_exact_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word);
    let mut payload = vec![0u8; len as usize];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let event = bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some((event, FRAME_OVERHEAD + u64::from(len))))
}

/// Intact records in order, and the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0;
    while let Some((event, size)) = read_record(&mut reader)? {
        events.push(event);
        intact += size;
    }
    Ok((events, intact))
}

// ── Log file ──────────────────────────────────────────────────────

/// Append-only event log. Owned by the writer task once the engine is up.
///
/// `durable_len` is the length of the fsynced prefix. Anything past it is
/// either buffered or a failed write, and never survives into the next commit.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    durable_len: u64,
    pending_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open for appending after the last intact record.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Replay the log and open it for appending.
    ///
    /// A torn or corrupt tail is cut off first. Appending behind it would hide
    /// every later record from the next replay.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let (events, intact) = scan(path)?;
        let file = Self::open_append(path)?;
        let file_len = file.metadata()?.len();
        if file_len > intact {
            tracing::warn!(
                path = %path.display(),
                intact,
                dropped = file_len - intact,
                "truncating torn WAL tail"
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len: intact,
            pending_len: 0,
            appends_since_compact: 0,
        };
        Ok((wal, events))
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Buffer one record. Not durable until [`Wal::commit`].
    pub fn buffer(&mut self, event: &Event) -> io::Result<()> {
        self.pending_len += write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn commit(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_len;
        self.pending_len = 0;
        Ok(())
    }

    /// Throw away everything after the durable prefix, on disk and in the buffer.
    pub fn discard_uncommitted(&mut self) -> io::Result<()> {
        let file = Self::open_append(&self.path)?;
        // `into_parts` drops the buffered bytes without flushing them.
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = old.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.pending_len = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a temp file, fsync, rename over.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut written = 0;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                written += write_record(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.durable_len = written;
        self.pending_len = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact record in order. A missing file is an empty log. Read-only.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

// ── Group-commit writer ───────────────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

enum WalCommand {
    Append { event: Event, reply: Reply<io::Result<()>> },
    Compact { events: Vec<Event>, reply: Reply<io::Result<()>> },
    AppendsSinceCompact { reply: Reply<u64> },
}

/// Cloneable handle to the task that owns the [`Wal`].
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down")
}

impl WalHandle {
    /// Move `wal` onto a background task. Must be called inside a Tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Resolves once `event` is fsynced, possibly together with others.
    pub async fn append(&self, event: Event) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { event, reply })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, reply })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(WalCommand::AppendsSinceCompact { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Take the first append, greedily drain whatever else is already queued,
/// then pay for one fsync. A non-append command ends the batch and runs
/// after it has been flushed.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, reply) = match cmd {
            WalCommand::Append { event, reply } => (event, reply),
            other => {
                run_control(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, reply)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, reply } => batch.push((event, reply)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        flush_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            run_control(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: Vec<(Event, Reply<io::Result<()>>)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut outcome = batch.iter().try_for_each(|(event, _)| wal.buffer(event));
    // Flush even after a failed buffer so no half-written batch leaks into the next one.
    let committed = wal.commit();
    if outcome.is_ok() {
        outcome = committed;
    }
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &outcome {
        tracing::warn!(error = %e, events = batch.len(), "WAL flush failed");
        if let Err(e) = wal.discard_uncommitted() {
            tracing::error!(error = %e, "could not roll WAL back to its durable length");
        }
    }
    for (_, reply) in batch {
        let result = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = reply.send(result);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, reply } => {
            let _ = reply.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { reply } => {
            let _ = reply.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, reply } => flush_batch(wal, vec![(event, reply)]),
    }
}
