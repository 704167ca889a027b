//! The object layer: arbitrary byte streams on top of contents.
//!
//! Streams run through the content-defined chunker; every chunk becomes
//! a content. Objects with many chunks get an indirect block (a content
//! in namespace `I` listing child object ids with their lengths), built
//! recursively so arbitrarily large objects need bounded memory on both
//! the write and the read path.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{ContentId, ObjectId, RepoError, NS_DIRECTORY, NS_INDIRECT, NS_NONE};
use silo_tools::LruCache;

use crate::chunker::{Chunker, SplitterConfig};
use crate::content::ContentManager;

/// Children per indirect block before another tree level is added.
pub const DEFAULT_INDIRECT_FANOUT: usize = 1000;

/// How much to pull from the source stream per read.
const READ_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Serialize, Deserialize)]
struct IndirectEntry {
    /// Plaintext length of the child object.
    l: u64,
    /// Child object id.
    o: ObjectId,
}

pub struct ObjectManager {
    content: Arc<ContentManager>,
    splitter: SplitterConfig,
    fanout: usize,
}

impl ObjectManager {
    pub fn new(content: Arc<ContentManager>, splitter: SplitterConfig) -> Self {
        Self::with_fanout(content, splitter, DEFAULT_INDIRECT_FANOUT)
    }

    pub fn with_fanout(
        content: Arc<ContentManager>,
        splitter: SplitterConfig,
        fanout: usize,
    ) -> Self {
        Self {
            content,
            splitter,
            fanout: fanout.max(2),
        }
    }

    pub fn content(&self) -> &Arc<ContentManager> {
        &self.content
    }

    pub fn splitter(&self) -> &SplitterConfig {
        &self.splitter
    }

    /// Store a byte stream, returning its object id. `metadata` routes
    /// the chunks into the metadata namespace (directory manifests).
    pub fn write_object(&self, reader: &mut dyn Read, metadata: bool) -> Result<ObjectId, Error> {
        let namespace = if metadata { NS_DIRECTORY } else { NS_NONE };

        let mut chunker = Chunker::new(&self.splitter);
        let mut buffer: Vec<u8> = Vec::new();
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut scan_pos = 0usize;
        let mut chunks: Vec<(u64, ObjectId)> = Vec::new();

        loop {
            let count = reader.read(&mut read_buf)?;
            if count == 0 {
                break;
            }
            buffer.extend_from_slice(&read_buf[..count]);

            loop {
                let boundary = chunker.scan(&buffer[scan_pos..]);
                if boundary == 0 {
                    scan_pos = buffer.len();
                    break;
                }
                let chunk_end = scan_pos + boundary;
                let chunk_len = chunk_end as u64;
                let id = self.content.write_content(&buffer[..chunk_end], namespace)?;
                chunks.push((chunk_len, ObjectId::Direct(id)));
                buffer.drain(..chunk_end);
                scan_pos = 0;
            }
        }

        if chunks.is_empty() && buffer.len() < self.splitter.min && !metadata {
            // small object, lives inline in the id itself; metadata
            // objects (directory manifests) always become contents so
            // they share the dedup namespace
            return Ok(ObjectId::Inline(buffer));
        }

        if !buffer.is_empty() || chunks.is_empty() {
            let id = self.content.write_content(&buffer, namespace)?;
            chunks.push((buffer.len() as u64, ObjectId::Direct(id)));
        }

        if chunks.len() == 1 {
            return Ok(chunks.pop().unwrap().1);
        }

        self.build_indirect(chunks)
    }

    /// The child object ids of one indirect block.
    pub fn indirect_children(&self, id: &ContentId) -> Result<Vec<ObjectId>, Error> {
        let payload = self
            .content
            .get_content(id)
            .context("reading indirect block")?;
        let entries: Vec<IndirectEntry> = serde_json::from_slice(&payload)
            .map_err(|err| RepoError::Corrupt(format!("indirect block - {}", err)))?;
        Ok(entries.into_iter().map(|entry| entry.o).collect())
    }

    pub fn write_object_bytes(&self, data: &[u8], metadata: bool) -> Result<ObjectId, Error> {
        self.write_object(&mut &data[..], metadata)
    }

    fn build_indirect(&self, chunks: Vec<(u64, ObjectId)>) -> Result<ObjectId, Error> {
        let mut level = chunks;

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / self.fanout + 1);
            for group in level.chunks(self.fanout) {
                let entries: Vec<IndirectEntry> = group
                    .iter()
                    .map(|(len, obj)| IndirectEntry {
                        l: *len,
                        o: obj.clone(),
                    })
                    .collect();
                let payload = serde_json::to_vec(&entries)?;
                let id = self.content.write_content(&payload, NS_INDIRECT)?;
                let total: u64 = group.iter().map(|(len, _)| len).sum();
                next.push((total, ObjectId::Indirect(id)));
            }
            level = next;
        }

        Ok(level.pop().unwrap().1)
    }

    /// Open a seekable reader over an object. Chunks are fetched lazily;
    /// the most recently used indirect blocks and the current chunk stay
    /// cached.
    pub fn open_object(&self, id: &ObjectId) -> Result<ObjectReader<'_>, Error> {
        let mut reader = ObjectReader {
            manager: self,
            root: id.clone(),
            length: 0,
            pos: 0,
            table_cache: LruCache::new(4),
            chunk_cache: None,
        };
        reader.length = reader.measure(&id.clone())?;
        Ok(reader)
    }

    /// Convenience: read a whole object into memory.
    pub fn read_object(&self, id: &ObjectId) -> Result<Vec<u8>, Error> {
        let mut reader = self.open_object(id)?;
        let mut data = Vec::with_capacity(reader.len() as usize);
        reader.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Every content id referenced by an object, without checking
    /// liveness. Maintenance marking walks the graph with this.
    pub fn referenced_contents(&self, id: &ObjectId) -> Result<Vec<ContentId>, Error> {
        let mut ids = Vec::new();
        self.collect_ids(id, &mut ids)?;
        Ok(ids)
    }

    /// Walk the object tree, returning every referenced content id and
    /// verifying each resolves in the index.
    pub fn verify_object(&self, id: &ObjectId) -> Result<Vec<ContentId>, Error> {
        let mut ids = Vec::new();
        self.collect_ids(id, &mut ids)?;
        for content_id in &ids {
            if !self.content.is_live(content_id) {
                return Err(RepoError::NotFound(format!(
                    "content {} referenced by object is missing",
                    content_id
                ))
                .into());
            }
        }
        Ok(ids)
    }

    fn collect_ids(&self, id: &ObjectId, out: &mut Vec<ContentId>) -> Result<(), Error> {
        match id {
            ObjectId::Inline(_) => Ok(()),
            ObjectId::Direct(content_id) => {
                out.push(*content_id);
                Ok(())
            }
            ObjectId::Indirect(content_id) => {
                out.push(*content_id);
                let payload = self
                    .content
                    .get_content(content_id)
                    .context("reading indirect block")?;
                let entries: Vec<IndirectEntry> = serde_json::from_slice(&payload)
                    .map_err(|err| RepoError::Corrupt(format!("indirect block - {}", err)))?;
                for entry in entries {
                    self.collect_ids(&entry.o, out)?;
                }
                Ok(())
            }
        }
    }
}

struct TableEntry {
    /// Cumulative end offset within this indirect block.
    end: u64,
    obj: ObjectId,
}

/// Lazy, seekable reader over a stored object.
pub struct ObjectReader<'a> {
    manager: &'a ObjectManager,
    root: ObjectId,
    length: u64,
    pos: u64,
    table_cache: LruCache<ContentId, Arc<Vec<TableEntry>>>,
    /// `(start offset, bytes)` of the chunk the cursor is in.
    chunk_cache: Option<(u64, Arc<Vec<u8>>)>,
}

impl<'a> ObjectReader<'a> {
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn load_table(&mut self, id: &ContentId) -> Result<Arc<Vec<TableEntry>>, Error> {
        if let Some(table) = self.table_cache.get_mut(id) {
            return Ok(Arc::clone(table));
        }

        let payload = self.manager.content.get_content(id)?;
        let entries: Vec<IndirectEntry> = serde_json::from_slice(&payload)
            .map_err(|err| RepoError::Corrupt(format!("indirect block - {}", err)))?;

        let mut end = 0u64;
        let table: Vec<TableEntry> = entries
            .into_iter()
            .map(|entry| {
                end += entry.l;
                TableEntry { end, obj: entry.o }
            })
            .collect();

        let table = Arc::new(table);
        self.table_cache.insert(*id, Arc::clone(&table));
        Ok(table)
    }

    fn measure(&mut self, id: &ObjectId) -> Result<u64, Error> {
        match id {
            ObjectId::Inline(data) => Ok(data.len() as u64),
            ObjectId::Direct(content_id) => {
                let data = self.manager.content.get_content(content_id)?;
                let len = data.len() as u64;
                self.chunk_cache = Some((0, Arc::new(data)));
                Ok(len)
            }
            ObjectId::Indirect(content_id) => {
                let table = self.load_table(content_id)?;
                Ok(table.last().map(|entry| entry.end).unwrap_or(0))
            }
        }
    }

    /// Fetch the chunk containing `pos`, returning its start offset and
    /// bytes.
    fn fetch_chunk_at(&mut self, pos: u64) -> Result<(u64, Arc<Vec<u8>>), Error> {
        let mut base = 0u64;
        let mut current = self.root.clone();

        loop {
            match current {
                ObjectId::Inline(data) => return Ok((base, Arc::new(data))),
                ObjectId::Direct(content_id) => {
                    let data = self.manager.content.get_content(&content_id)?;
                    return Ok((base, Arc::new(data)));
                }
                ObjectId::Indirect(content_id) => {
                    let table = self.load_table(&content_id)?;
                    let rel = pos - base;
                    let idx = table.partition_point(|entry| entry.end <= rel);
                    if idx >= table.len() {
                        bail!("object read position {} out of range", pos);
                    }
                    let child_start = if idx == 0 { 0 } else { table[idx - 1].end };
                    base += child_start;
                    current = table[idx].obj.clone();
                }
            }
        }
    }
}

impl<'a> Read for ObjectReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.length || buf.is_empty() {
            return Ok(0);
        }

        let cached = match &self.chunk_cache {
            Some((start, data))
                if self.pos >= *start && self.pos < *start + data.len() as u64 =>
            {
                Some((*start, Arc::clone(data)))
            }
            _ => None,
        };

        let (start, data) = match cached {
            Some(found) => found,
            None => {
                let found = self
                    .fetch_chunk_at(self.pos)
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                self.chunk_cache = Some((found.0, Arc::clone(&found.1)));
                found
            }
        };

        let offset = (self.pos - start) as usize;
        let available = data.len() - offset;
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        self.pos += count as u64;
        Ok(count)
    }
}

impl<'a> Seek for ObjectReader<'a> {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let target = match from {
            SeekFrom::Start(pos) => pos as i64,
            SeekFrom::End(delta) => self.length as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of object",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
