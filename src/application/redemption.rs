use super::account_locks::AccountLocks;
use super::reply::Reply;
use crate::domain::key::normalize_code;
use crate::domain::payment::UserId;
use crate::domain::ports::{AccountServiceRef, KeyStoreRef};
use crate::error::{AccountError, Result};
use tracing::{error, info};

/// Account id for a subscription opened with an activation key.
pub fn key_account_id(user_id: UserId, code: &str) -> String {
    format!("key_{user_id}_{code}")
}

/// Exchanges activation keys for subscription time.
#[derive(Clone)]
pub struct KeyRedemption {
    keys: KeyStoreRef,
    accounts: AccountServiceRef,
    account_locks: AccountLocks,
}

impl KeyRedemption {
    pub fn new(keys: KeyStoreRef, accounts: AccountServiceRef, account_locks: AccountLocks) -> Self {
        Self {
            keys,
            accounts,
            account_locks,
        }
    }

    /// Spends one use of `code` and adds its months to `existing_account`, or to
    /// a fresh account when the user has none.
    pub async fn redeem(
        &self,
        code: &str,
        user_id: UserId,
        existing_account: Option<&str>,
    ) -> Result<Reply> {
        let code = normalize_code(code);
        let Some(key) = self.keys.get(&code).await? else {
            return Ok(Reply::KeyUnknown);
        };
        if key.uses_left == 0 {
            return Ok(Reply::KeyExhausted);
        }
        let Some(months) = self.keys.consume(&code, user_id).await? else {
            return Ok(Reply::KeyExhausted);
        };
        info!(user_id, months, "Activation key consumed");

        let existing = existing_account.map(str::trim).filter(|a| !a.is_empty());
        let account = match existing {
            Some(account) => account.to_string(),
            None => key_account_id(user_id, &code),
        };
        let outcome = {
            let _serial = self.account_locks.lock(&account).await;
            if existing.is_some() {
                self.accounts.extend(&account, months).await
            } else {
                match self.accounts.provision(&account, months).await {
                    // Same user redeeming a multi-use key again.
                    Err(AccountError::AlreadyExists(_)) => {
                        self.accounts.extend(&account, months).await
                    }
                    other => other,
                }
            }
        };

        if let Err(e) = outcome {
            error!(user_id, %account, error = %e, "Key consumed but account service failed");
            return Ok(Reply::RedemptionFailed { code });
        }

        let link = self.accounts.get_link(&account).await.unwrap_or_default();
        info!(user_id, %account, months, "Activation key redeemed");
        Ok(Reply::KeyRedeemed {
            account,
            months,
            link,
        })
    }
}
