use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, Permission};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

use crate::{Acl, MediaConfig, MediaError, MediaResult, ObjectStore, RemoteLocator};

const ALL_USERS_GROUP: &str = "http://acs.amazonaws.com/groups/global/AllUsers";

/// Object store backed by the AWS SDK (S3 and S3-compatible services)
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Build a client from configuration
    pub async fn connect(config: &MediaConfig) -> MediaResult<Self> {
        config.validate()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(credentials) = &config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                None,
                None,
                "dog-media",
            ));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let shared = loader.load().await;
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(config.force_path_style)
                .build(),
        );

        debug!("Connected S3 client for region {}", config.region);
        Ok(Self::from_client(client))
    }

    /// Use a client the host constructed itself, e.g. one routed through a proxy
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn canned(acl: Acl) -> ObjectCannedAcl {
        match acl {
            Acl::PublicRead => ObjectCannedAcl::PublicRead,
            Acl::Private => ObjectCannedAcl::Private,
        }
    }

    fn map_sdk_error<E, R>(err: SdkError<E, R>) -> MediaError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        let code = err.code().unwrap_or("Unknown").to_string();
        MediaError::remote(code, DisplayErrorContext(&err).to_string())
    }
}

/// Percent-encode a key for the `x-amz-copy-source` header, keeping `/`
fn encode_copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + key.len() + 1);
    encoded.push_str(bucket);
    encoded.push('/');
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn exists(&self, locator: &RemoteLocator) -> MediaResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(false),
            Err(err) => Err(Self::map_sdk_error(err)),
        }
    }

    async fn read(&self, locator: &RemoteLocator) -> MediaResult<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().map_or(false, |e| e.is_no_such_key()) {
                    MediaError::not_found(locator.to_path())
                } else {
                    Self::map_sdk_error(err)
                }
            })?;

        let body = result
            .body
            .collect()
            .await
            .map_err(|err| MediaError::remote("ReadBody", err.to_string()))?;
        Ok(body.into_bytes())
    }

    async fn write(
        &self,
        locator: &RemoteLocator,
        body: Bytes,
        content_type: Option<&str>,
        acl: Acl,
    ) -> MediaResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .acl(Self::canned(acl))
            .body(AwsByteStream::from(body));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request.send().await.map_err(Self::map_sdk_error)?;
        Ok(())
    }

    async fn copy(&self, from: &RemoteLocator, to: &RemoteLocator) -> MediaResult<()> {
        let acl = self.get_acl(from).await?;
        self.client
            .copy_object()
            .copy_source(encode_copy_source(&from.bucket, &from.key))
            .bucket(&to.bucket)
            .key(&to.key)
            .acl(Self::canned(acl))
            .send()
            .await
            .map_err(Self::map_sdk_error)?;
        Ok(())
    }

    async fn delete(&self, locator: &RemoteLocator) -> MediaResult<()> {
        self.client
            .delete_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(Self::map_sdk_error)?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> MediaResult<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(Self::map_sdk_error)?;
            keys.extend(page.contents().iter().filter_map(|object| object.key().map(str::to_string)));
        }
        Ok(keys)
    }

    async fn get_acl(&self, locator: &RemoteLocator) -> MediaResult<Acl> {
        let result = self
            .client
            .get_object_acl()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(Self::map_sdk_error)?;

        let public = result.grants().iter().any(|grant| {
            let everyone = grant
                .grantee()
                .and_then(|grantee| grantee.uri())
                .map_or(false, |uri| uri == ALL_USERS_GROUP);
            let readable = matches!(grant.permission(), Some(Permission::Read) | Some(Permission::FullControl));
            everyone && readable
        });

        Ok(if public { Acl::PublicRead } else { Acl::Private })
    }

    async fn set_acl(&self, locator: &RemoteLocator, acl: Acl) -> MediaResult<()> {
        self.client
            .put_object_acl()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .acl(Self::canned(acl))
            .send()
            .await
            .map_err(Self::map_sdk_error)?;
        Ok(())
    }

    async fn presign_get(&self, locator: &RemoteLocator, expires_in: Duration) -> MediaResult<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|err| MediaError::invalid(format!("presign expiry: {}", err)))?;

        let request = self
            .client
            .get_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .presigned(presigning)
            .await
            .map_err(Self::map_sdk_error)?;

        Ok(request.uri().to_string())
    }
}
