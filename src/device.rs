//! Device identity headers.
//!
//! Every API request identifies the installation and platform it comes
//! from:
//!
//! | Header           | Example                                |
//! |------------------|----------------------------------------|
//! | `X-Device-ID`    | `9f1c5b6e-2f7a-5d0e-8a41-6c2b7d3e9f10` |
//! | `X-Device-Model` | `Linux Device`                         |
//! | `X-App-Version`  | `0.1.0`                                |
//! | `X-Platform`     | `Linux`                                |
//! | `X-Os-Version`   | `Linux 24.04`                          |
//!
//! The headers come from a [`DeviceContextProvider`]. Providers never fail:
//! anything they cannot detect falls back to a default value.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::storage::{Storage, DEVICE_ID_KEY};

pub const DEVICE_ID_HEADER: HeaderName = HeaderName::from_static("x-device-id");
pub const DEVICE_MODEL_HEADER: HeaderName = HeaderName::from_static("x-device-model");
pub const APP_VERSION_HEADER: HeaderName = HeaderName::from_static("x-app-version");
pub const PLATFORM_HEADER: HeaderName = HeaderName::from_static("x-platform");
pub const OS_VERSION_HEADER: HeaderName = HeaderName::from_static("x-os-version");

/// Identity of this installation as sent to the API.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHeaders {
    pub device_id: String,
    pub device_model: String,
    pub app_version: String,
    pub platform: String,
    pub os_version: String,
}

impl DeviceHeaders {
    /// Converts to request headers.
    ///
    /// Values that are not valid header values are left out.
    #[must_use]
    pub fn to_header_map(&self) -> HeaderMap {
        let fields = [
            (DEVICE_ID_HEADER, &self.device_id),
            (DEVICE_MODEL_HEADER, &self.device_model),
            (APP_VERSION_HEADER, &self.app_version),
            (PLATFORM_HEADER, &self.platform),
            (OS_VERSION_HEADER, &self.os_version),
        ];

        let mut headers = HeaderMap::with_capacity(fields.len());
        for (name, value) in fields {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(e) => warn!("skipping device header {name}: {e}"),
            }
        }

        headers
    }
}

/// Source of the device identity headers.
#[async_trait]
pub trait DeviceContextProvider: Send + Sync {
    /// Returns the headers for the next request.
    async fn device_headers(&self) -> DeviceHeaders;
}

/// Fixed device headers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StaticDevice(pub DeviceHeaders);

#[async_trait]
impl DeviceContextProvider for StaticDevice {
    async fn device_headers(&self) -> DeviceHeaders {
        self.0.clone()
    }
}

/// Device headers detected from the running system.
///
/// The device id is read from storage when present. Otherwise it is derived
/// from the machine id, or drawn at random when that is unavailable, and
/// written back to storage so it survives restarts. Detection runs once per
/// provider.
pub struct SystemDevice {
    app_version: String,
    storage: Option<Arc<dyn Storage>>,
    cached: OnceCell<DeviceHeaders>,
}

impl SystemDevice {
    #[must_use]
    pub fn new(app_version: impl Into<String>, storage: Option<Arc<dyn Storage>>) -> Self {
        Self {
            app_version: app_version.into(),
            storage,
            cached: OnceCell::new(),
        }
    }

    fn device_id(&self) -> String {
        let stored = self
            .storage
            .as_ref()
            .and_then(|storage| storage.get(DEVICE_ID_KEY))
            .filter(|id| !id.is_empty());
        if let Some(id) = stored {
            return id;
        }

        let device_id = match machine_uid::get() {
            Ok(machine_id) => {
                let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"joyful.app");
                Uuid::new_v5(&namespace, machine_id.as_bytes())
            }
            Err(e) => {
                warn!("could not get machine id, using random device id: {e}");
                Uuid::new_v4()
            }
        }
        .to_string();
        trace!("device uuid: {device_id}");

        if let Some(storage) = &self.storage {
            storage.set(DEVICE_ID_KEY, &device_id);
        }

        device_id
    }

    fn detect(&self) -> DeviceHeaders {
        let (platform, device_model) = match std::env::consts::OS {
            "macos" => ("macOS", "Mac"),
            "windows" => ("Windows", "Windows PC"),
            "linux" => ("Linux", "Linux Device"),
            "android" => ("Android", "Android Device"),
            "ios" => ("iOS", "iPhone"),
            _ => ("Unknown", "Unknown Device"),
        };

        let os_version = match sysinfo::System::os_version() {
            Some(version) if !version.is_empty() => format!("{platform} {version}"),
            _ => platform.to_owned(),
        };

        DeviceHeaders {
            device_id: self.device_id(),
            device_model: device_model.to_owned(),
            app_version: self.app_version.clone(),
            platform: platform.to_owned(),
            os_version,
        }
    }
}

#[async_trait]
impl DeviceContextProvider for SystemDevice {
    async fn device_headers(&self) -> DeviceHeaders {
        self.cached
            .get_or_init(|| async { self.detect() })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn stored_device_id_wins() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.set(DEVICE_ID_KEY, "stored-id");

        let device = SystemDevice::new("1.2.3", Some(storage));
        let headers = device.device_headers().await;
        assert_eq!(headers.device_id, "stored-id");
        assert_eq!(headers.app_version, "1.2.3");
    }

    #[tokio::test]
    async fn generated_device_id_is_persisted_and_stable() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let first = SystemDevice::new("1.0.0", Some(Arc::clone(&storage)))
            .device_headers()
            .await;
        assert_eq!(storage.get(DEVICE_ID_KEY), Some(first.device_id.clone()));

        let second = SystemDevice::new("1.0.0", Some(storage))
            .device_headers()
            .await;
        assert_eq!(first.device_id, second.device_id);
    }

    #[tokio::test]
    async fn headers_are_complete_without_storage() {
        let headers = SystemDevice::new("1.0.0", None).device_headers().await;
        assert!(!headers.device_id.is_empty());
        assert!(!headers.platform.is_empty());
        assert!(headers.os_version.starts_with(&headers.platform));

        let map = headers.to_header_map();
        for name in ["X-Device-ID", "X-Device-Model", "X-App-Version", "X-Platform", "X-Os-Version"] {
            assert!(map.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn invalid_values_are_skipped() {
        let headers = DeviceHeaders {
            device_id: "id".to_owned(),
            device_model: "bad\nmodel".to_owned(),
            app_version: "1.0.0".to_owned(),
            platform: "Linux".to_owned(),
            os_version: "Linux".to_owned(),
        };
        let map = headers.to_header_map();
        assert_eq!(map.len(), 4);
        assert!(!map.contains_key(DEVICE_MODEL_HEADER));
    }
}
