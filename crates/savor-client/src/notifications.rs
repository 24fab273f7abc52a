use std::sync::Mutex;

use tracing::info;

use savor_types::models::DevicePlatform;

use crate::gateway::{Backend, Gateway};

/// Push registration for this device. Delivery happens server-side; the
/// client only tells the backend where to deliver.
pub struct DeviceRegistry<B> {
    gateway: Gateway<B>,
    registered: Mutex<Option<String>>,
}

impl<B: Backend> DeviceRegistry<B> {
    pub fn new(gateway: Gateway<B>) -> Self {
        Self {
            gateway,
            registered: Mutex::new(None),
        }
    }

    pub fn registered_token(&self) -> Option<String> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Registers `token`. Registering a token the backend already has counts
    /// as success.
    pub async fn register(&self, token: &str, platform: DevicePlatform) -> Result<(), String> {
        let token = token.trim();
        if token.is_empty() {
            return Err("Invalid device token".to_string());
        }
        if self.registered_token().as_deref() == Some(token) {
            return Ok(());
        }

        self.gateway
            .register_device(token.to_string(), platform)
            .await
            .into_result()?;
        info!("Push notifications enabled ({:?})", platform);
        *self.registered.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
        Ok(())
    }

    /// Removes this device's registration, typically on sign-out.
    pub async fn unregister(&self) -> Result<(), String> {
        let Some(token) = self.registered_token() else {
            return Ok(());
        };
        self.gateway.unregister_device(token).await.into_result()?;
        *self.registered.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::FakeBackend;

    #[tokio::test]
    async fn test_reregistering_a_known_token_succeeds() {
        let backend = Arc::new(FakeBackend::new());
        let first = DeviceRegistry::new(Gateway::from_shared(Arc::clone(&backend)));
        first.register("fcm-token", DevicePlatform::Android).await.unwrap();

        // A fresh app start does not know the token is already stored
        let second = DeviceRegistry::new(Gateway::from_shared(Arc::clone(&backend)));
        second.register("fcm-token", DevicePlatform::Android).await.unwrap();
        assert_eq!(second.registered_token().as_deref(), Some("fcm-token"));
        assert_eq!(backend.devices(), 1);

        second.unregister().await.unwrap();
        assert_eq!(backend.devices(), 0);
        assert!(first.register(" ", DevicePlatform::Web).await.is_err());
    }
}
