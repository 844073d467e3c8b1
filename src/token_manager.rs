use crate::api_client::{AdsApi, AdvertiserRef};
use crate::credentials::CredentialStore;
use crate::error::Error;
use log::{error, info};

/// Result of a successful refresh: a fresh access token and the advertiser
/// accounts approved for the credential set.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub advertisers: Vec<AdvertiserRef>,
}

pub struct TokenManager<'a> {
    api: &'a dyn AdsApi,
    store: &'a dyn CredentialStore,
}

impl<'a> TokenManager<'a> {
    pub fn new(api: &'a dyn AdsApi, store: &'a dyn CredentialStore) -> Self {
        TokenManager { api, store }
    }

    /// Rotates the refresh token stored at `row_index` and returns the new session.
    ///
    /// The store is only written after the platform issued a new pair. A failed
    /// write is logged and the access token is still returned.
    pub async fn refresh(&self, row_index: usize) -> Result<Session, Error> {
        let credential = self.store.read_credential(row_index)?;
        info!(
            "refreshing access token for credential row {} (app {})",
            credential.row_index, credential.app_id
        );

        let grant = self.api.refresh_token(&credential).await?;

        if let Err(err) = self
            .store
            .update_credential(row_index, &grant.refresh_token)
        {
            error!("new refresh token could not be persisted: {}", err);
        }

        for advertiser in &grant.approval_advertisers {
            info!(
                "approved advertiser {} ({})",
                advertiser.advertiser_id,
                advertiser.display_name()
            );
        }

        Ok(Session {
            access_token: grant.access_token,
            advertisers: grant.approval_advertisers,
        })
    }

    /// Exchanges a one-time authorization code for the first token pair of the
    /// app stored at `row_index` and persists the issued refresh token.
    pub async fn authorize(&self, row_index: usize, auth_code: &str) -> Result<Session, Error> {
        let credential = self.store.read_credential(row_index)?;
        info!(
            "exchanging authorization code for credential row {} (app {})",
            row_index, credential.app_id
        );

        let grant = self
            .api
            .exchange_auth_code(credential.app_id, &credential.secret, auth_code)
            .await?;

        self.store
            .update_credential(row_index, &grant.refresh_token)?;

        Ok(Session {
            access_token: grant.access_token,
            advertisers: grant.approval_advertisers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{MockAdsApi, TokenGrant};
    use crate::credentials::FileCredentialStore;
    use mockall::predicate::eq;
    use std::fs;
    use tempfile::TempDir;

    const STORE: &str = "app_id,secret,refresh_token\n\
                         4258,secret-a,refresh-a\n\
                         4259,secret-b,refresh-b\n";

    fn store() -> (TempDir, FileCredentialStore) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tokens.csv");
        fs::write(&path, STORE).unwrap();
        let store = FileCredentialStore::from_path(&path);
        (temp_dir, store)
    }

    fn grant(access: &str, refresh: &str) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            approval_advertisers: vec![AdvertiserRef {
                advertiser_id: "1001".to_string(),
                advertiser_name: Some("Shop A".to_string()),
            }],
        }
    }

    #[tokio::test]
    async fn test_refresh_persists_new_refresh_token() {
        let (_dir, store) = store();
        let mut api = MockAdsApi::new();
        api.expect_refresh_token()
            .withf(|credential| {
                credential.app_id == 4259
                    && credential.secret == "secret-b"
                    && credential.refresh_token == "refresh-b"
            })
            .times(1)
            .returning(|_| Ok(grant("access-new", "refresh-new")));

        let manager = TokenManager::new(&api, &store);
        let session = manager.refresh(2).await.unwrap();

        assert_eq!(session.access_token, "access-new");
        assert_eq!(session.advertisers.len(), 1);
        assert_eq!(session.advertisers[0].advertiser_id, "1001");
        assert_eq!(store.read_credential(2).unwrap().refresh_token, "refresh-new");
        assert_eq!(store.read_credential(1).unwrap().refresh_token, "refresh-a");
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_store_untouched() {
        let (dir, store) = store();
        let mut api = MockAdsApi::new();
        api.expect_refresh_token().times(1).returning(|_| {
            Err(Error::Refresh {
                message: "invalid token".to_string(),
            })
        });

        let manager = TokenManager::new(&api, &store);
        let err = manager.refresh(1).await.unwrap_err();

        assert!(matches!(err, Error::Refresh { message } if message == "invalid token"));
        let contents = fs::read_to_string(dir.path().join("tokens.csv")).unwrap();
        assert_eq!(contents, STORE);
    }

    #[tokio::test]
    async fn test_refresh_unknown_row_skips_api() {
        let (_dir, store) = store();
        let mut api = MockAdsApi::new();
        api.expect_refresh_token().never();

        let manager = TokenManager::new(&api, &store);
        let err = manager.refresh(9).await.unwrap_err();

        assert!(matches!(err, Error::ReadCredential { row_index: 9, .. }));
    }

    #[tokio::test]
    async fn test_refresh_returns_token_when_store_write_fails() {
        let (dir, store) = store();
        let mut api = MockAdsApi::new();
        let path = dir.path().join("tokens.csv");
        api.expect_refresh_token().times(1).returning(move |_| {
            // The store disappears between read and write.
            fs::remove_file(&path).unwrap();
            Ok(grant("access-new", "refresh-new"))
        });

        let manager = TokenManager::new(&api, &store);
        let session = manager.refresh(1).await.unwrap();

        assert_eq!(session.access_token, "access-new");
    }

    #[tokio::test]
    async fn test_authorize_persists_refresh_token() {
        let (_dir, store) = store();
        let mut api = MockAdsApi::new();
        api.expect_exchange_auth_code()
            .with(eq(4258), eq("secret-a"), eq("code-123"))
            .times(1)
            .returning(|_, _, _| Ok(grant("access-first", "refresh-first")));

        let manager = TokenManager::new(&api, &store);
        let session = manager.authorize(1, "code-123").await.unwrap();

        assert_eq!(session.access_token, "access-first");
        assert_eq!(store.read_credential(1).unwrap().refresh_token, "refresh-first");
    }
}
