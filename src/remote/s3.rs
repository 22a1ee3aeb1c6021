//! S3-compatible backend: ranged GETs, content-MD5 on uploads, multipart
//! upload for large objects with bounded per-part concurrency.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use log::warn;
use tokio::sync::Semaphore;

use crate::error::{FsError, FsResult};
use crate::models::{Entry, EntryKind, TierKind};
use crate::remote::client::RemoteBackend;
use crate::util::{join, norm_path};

/// Connection and upload tuning.
#[derive(Clone, Debug)]
pub struct S3Options {
    pub endpoint: Option<String>,
    pub region: String,
    /// Static credentials; environment credentials are used when absent.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Objects above this size go through multipart upload.
    pub part_size: usize,
    /// Concurrent part uploads per object.
    pub max_concurrency: usize,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".into(),
            access_key_id: None,
            secret_access_key: None,
            part_size: 8 * 1024 * 1024,
            max_concurrency: 8,
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    opts: S3Options,
}

impl S3Backend {
    pub async fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        opts: S3Options,
    ) -> FsResult<Self> {
        let mut loader =
            aws_config::ConfigLoader::default().region(Region::new(opts.region.clone()));
        loader = match (&opts.access_key_id, &opts.secret_access_key) {
            (Some(ak), Some(sk)) => loader
                .credentials_provider(Credentials::new(ak.clone(), sk.clone(), None, None, "tierfs")),
            _ => loader.credentials_provider(
                aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
            ),
        };
        if let Some(endpoint) = &opts.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let conf = loader.load().await;
        Ok(Self {
            client: Client::new(&conf),
            bucket: bucket.into(),
            prefix: prefix.into(),
            opts,
        })
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    /// Map a logical path to its object key under the configured prefix.
    fn key_for(&self, path: &str) -> String {
        let p = norm_path(path);
        let rel = p.trim_start_matches('/');
        if self.prefix.is_empty() {
            rel.to_string()
        } else if rel.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, rel)
        }
    }

    /// Directory prefix for listing: trailing slash unless it is the root.
    fn list_prefix(&self, path: &str) -> String {
        let key = self.key_for(path);
        if key.is_empty() {
            key
        } else {
            format!("{key}/")
        }
    }

    fn entry_for_object(
        &self,
        dir: &str,
        name: &str,
        size: u64,
        mtime: SystemTime,
    ) -> Entry {
        Entry {
            path: join(dir, name),
            kind: EntryKind::File,
            size,
            mtime,
            tier: TierKind::RemoteOnly,
        }
    }

    async fn upload_part(
        client: Client,
        bucket: String,
        key: String,
        upload_id: String,
        part_number: i32,
        data: Vec<u8>,
        semaphore: Arc<Semaphore>,
    ) -> FsResult<CompletedPart> {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| FsError::RemoteUnavailable("upload pool closed".into()))?;
        let checksum = Self::md5_base64(&data);
        let resp = client
            .upload_part()
            .bucket(&bucket)
            .key(&key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .content_md5(checksum)
            .body(data.into())
            .send()
            .await
            .map_err(|e| classify("upload_part", &key, e))?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(resp.e_tag().map(|s| s.to_string()))
            .build())
    }

    async fn write_multipart(&self, key: &str, data: &[u8]) -> FsResult<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", key, e))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();
        let sem = Arc::new(Semaphore::new(self.opts.max_concurrency));

        let mut parts = Vec::new();
        let total = data.len();
        let mut idx = 0usize;
        let mut part_number = 1i32;
        while idx < total {
            let end = (idx + self.opts.part_size).min(total);
            parts.push(Self::upload_part(
                self.client.clone(),
                self.bucket.clone(),
                key.to_string(),
                upload_id.clone(),
                part_number,
                data[idx..end].to_vec(),
                sem.clone(),
            ));
            idx = end;
            part_number += 1;
        }

        let completed_parts = match futures::future::try_join_all(parts).await {
            Ok(v) => v,
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("abort_multipart_upload {key} failed: {abort_err}");
                }
                return Err(e);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", key, e))?;
        Ok(())
    }

    async fn head_entry(&self, path: &str) -> FsResult<Option<Entry>> {
        let key = self.key_for(path);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(head) => Ok(Some(Entry {
                path: norm_path(path),
                kind: EntryKind::File,
                size: head.content_length().unwrap_or(0).max(0) as u64,
                mtime: to_system_time(head.last_modified()),
                tier: TierKind::RemoteOnly,
            })),
            Err(e) => {
                if matches!(e.as_service_error(), Some(se) if se.is_not_found()) {
                    Ok(None)
                } else {
                    Err(classify("head_object", &key, e))
                }
            }
        }
    }
}

#[async_trait]
impl RemoteBackend for S3Backend {
    async fn list(&self, path: &str) -> FsResult<Vec<Entry>> {
        let dir = norm_path(path);
        let prefix = self.list_prefix(&dir);
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }
            let page = req
                .send()
                .await
                .map_err(|e| classify("list_objects_v2", &prefix, e))?;

            for cp in page.common_prefixes() {
                if let Some(p) = cp.prefix() {
                    let name = p
                        .strip_prefix(&prefix)
                        .unwrap_or(p)
                        .trim_end_matches('/');
                    if !name.is_empty() {
                        out.push(Entry {
                            path: join(&dir, name),
                            kind: EntryKind::Dir,
                            size: 0,
                            mtime: UNIX_EPOCH,
                            tier: TierKind::RemoteOnly,
                        });
                    }
                }
            }
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                let name = key.strip_prefix(&prefix).unwrap_or(key);
                // Skip the directory marker object for the prefix itself.
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                out.push(self.entry_for_object(
                    &dir,
                    name,
                    obj.size().unwrap_or(0).max(0) as u64,
                    to_system_time(obj.last_modified()),
                ));
            }

            match page.next_continuation_token() {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }
        Ok(out)
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let key = self.key_for(path);
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .range(range)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Err(
                    if matches!(e.as_service_error(), Some(se) if se.is_no_such_key()) {
                        FsError::NotFound(norm_path(path))
                    } else {
                        classify("get_object", &key, e)
                    },
                );
            }
        };
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| FsError::RemoteUnavailable(format!("get_object {key}: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn write(&self, path: &str, data: &[u8]) -> FsResult<Entry> {
        let key = self.key_for(path);
        if data.len() <= self.opts.part_size {
            let checksum = Self::md5_base64(data);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_md5(checksum)
                .body(data.to_owned().into())
                .send()
                .await
                .map_err(|e| classify("put_object", &key, e))?;
        } else {
            self.write_multipart(&key, data).await?;
        }
        // One head round-trip for the authoritative size/mtime.
        self.head_entry(path).await?.ok_or_else(|| {
            FsError::RemoteUnavailable(format!("{key}: written object not visible"))
        })
    }

    async fn rename(&self, path: &str, new_path: &str) -> FsResult<Entry> {
        let src_key = self.key_for(path);
        let dst_key = self.key_for(new_path);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .key(&dst_key)
            .send()
            .await
            .map_err(|e| {
                if e.code() == Some("NoSuchKey") {
                    FsError::NotFound(norm_path(path))
                } else {
                    classify("copy_object", &src_key, e)
                }
            })?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&src_key)
            .send()
            .await
            .map_err(|e| classify("delete_object", &src_key, e))?;
        self.head_entry(new_path).await?.ok_or_else(|| {
            FsError::RemoteUnavailable(format!("{dst_key}: renamed object not visible"))
        })
    }

    async fn delete(&self, path: &str) -> FsResult<()> {
        // S3 deletes are idempotent; probe first so a missing path surfaces.
        if self.head_entry(path).await?.is_none() {
            return Err(FsError::NotFound(norm_path(path)));
        }
        let key = self.key_for(path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify("delete_object", &key, e))?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> FsResult<Option<Entry>> {
        if let Some(entry) = self.head_entry(path).await? {
            return Ok(Some(entry));
        }
        // No object at the key: a non-empty listing under it means a dir.
        let prefix = self.list_prefix(path);
        let page = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| classify("list_objects_v2", &prefix, e))?;
        if page.key_count().unwrap_or(0) > 0 || norm_path(path) == "/" {
            Ok(Some(Entry {
                path: norm_path(path),
                kind: EntryKind::Dir,
                size: 0,
                mtime: UNIX_EPOCH,
                tier: TierKind::RemoteOnly,
            }))
        } else {
            Ok(None)
        }
    }
}

fn to_system_time(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> SystemTime {
    match dt {
        Some(d) if d.secs() >= 0 => {
            UNIX_EPOCH + Duration::new(d.secs() as u64, d.subsec_nanos())
        }
        _ => UNIX_EPOCH,
    }
}

/// Classify an SDK failure into the error taxonomy. Throttling codes become
/// `QuotaExceeded`; transport and unrecognized failures `RemoteUnavailable`.
fn classify<E, R>(op: &str, key: &str, err: SdkError<E, R>) -> FsError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") => FsError::NotFound(format!("/{key}")),
        Some("SlowDown") | Some("Throttling") | Some("TooManyRequests")
        | Some("RequestLimitExceeded") => {
            FsError::QuotaExceeded(format!("{op} {key}: {}", err.message().unwrap_or("throttled")))
        }
        _ => FsError::RemoteUnavailable(format!("{op} {key}: {err:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_mapping_respects_prefix() {
        let backend = S3Backend::new("bucket", "archive", S3Options::default())
            .await
            .unwrap();
        assert_eq!(backend.key_for("/a/b.txt"), "archive/a/b.txt");
        assert_eq!(backend.key_for("/"), "archive");
        assert_eq!(backend.list_prefix("/a"), "archive/a/");

        let bare = S3Backend::new("bucket", "", S3Options::default())
            .await
            .unwrap();
        assert_eq!(bare.key_for("/a/b.txt"), "a/b.txt");
        assert_eq!(bare.list_prefix("/"), "");
    }
}
