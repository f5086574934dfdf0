//! Affiliate accounts, settings and referral links.

use super::{Ledger, LedgerError};
use crate::auth::{hash_password, verify_password};
use crate::db::is_unique_violation;
use crate::domain::affiliate::{generate_code, normalize_code, normalize_email};
use crate::domain::link::is_valid_target_url;
use crate::domain::order::is_valid_rate;
use crate::domain::{
    Affiliate, AffiliateId, AffiliateLink, AffiliateSettings, AffiliateStatus, ClickContext,
    Decimal, NewAffiliate, Role, SettingsPatch,
};
use serde::Deserialize;
use tracing::{info, warn};

const MIN_PASSWORD_LEN: usize = 8;

/// Fields for a new account, from self-registration or an admin.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    /// Generated when absent.
    pub code: Option<String>,
    pub status: AffiliateStatus,
    pub role: Role,
    /// Falls back to the configured default.
    pub commission_rate: Option<Decimal>,
}

/// Admin changes to an affiliate's terms. `None` keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateUpdate {
    pub status: Option<AffiliateStatus>,
    pub commission_rate: Option<Decimal>,
}

impl Ledger {
    pub async fn create_affiliate(&self, account: NewAccount) -> Result<Affiliate, LedgerError> {
        let email = normalize_email(&account.email);
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            return Err(LedgerError::Invalid("invalid email".to_string()));
        }
        if account.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(LedgerError::Invalid(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        let code = match account.code.as_deref() {
            Some(raw) => normalize_code(raw)
                .ok_or_else(|| LedgerError::Invalid(format!("invalid code: {}", raw)))?,
            None => generate_code(),
        };
        let commission_rate = account
            .commission_rate
            .unwrap_or(self.config.default_commission_rate);
        if !is_valid_rate(commission_rate) {
            return Err(LedgerError::Invalid(
                "commission rate must be between 0 and 1".to_string(),
            ));
        }

        let new = NewAffiliate {
            email,
            password_hash: hash_password(&account.password),
            name: account.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            code,
            status: account.status,
            role: account.role,
            commission_rate,
        };

        match self.repo.insert_affiliate(&new).await {
            Ok(affiliate) => {
                info!(
                    affiliate_id = %affiliate.id,
                    code = %affiliate.code,
                    status = %affiliate.status,
                    "Affiliate created"
                );
                Ok(affiliate)
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::Conflict(
                "email or code already registered".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up an account by credentials.
    ///
    /// Returns None for an unknown email, a wrong password, or an account
    /// that may not sign in; callers must not tell these apart.
    pub async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Affiliate>, LedgerError> {
        let Some(affiliate) = self.repo.get_affiliate_by_email(&normalize_email(email)).await? else {
            return Ok(None);
        };
        if !verify_password(password, &affiliate.password_hash) {
            return Ok(None);
        }
        if !affiliate.status.may_sign_in() {
            info!(affiliate_id = %affiliate.id, status = %affiliate.status, "Sign-in refused");
            return Ok(None);
        }
        Ok(Some(affiliate))
    }

    pub async fn get_affiliate(&self, id: &AffiliateId) -> Result<Affiliate, LedgerError> {
        self.repo
            .get_affiliate(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("affiliate {}", id)))
    }

    /// Apply an admin update, then run the activation and rate-change side
    /// effects. Side-effect failures are logged and never undo the update.
    pub async fn update_affiliate(
        &self,
        id: &AffiliateId,
        update: AffiliateUpdate,
    ) -> Result<Affiliate, LedgerError> {
        let before = self.get_affiliate(id).await?;

        let status = update.status.unwrap_or(before.status);
        if !before.status.can_transition_to(status) {
            return Err(LedgerError::Invalid(format!(
                "cannot move affiliate from {} to {}",
                before.status, status
            )));
        }
        let commission_rate = update.commission_rate.unwrap_or(before.commission_rate);
        if !is_valid_rate(commission_rate) {
            return Err(LedgerError::Invalid(
                "commission rate must be between 0 and 1".to_string(),
            ));
        }

        if !self
            .repo
            .update_affiliate_terms(id, before.status, status, commission_rate)
            .await?
        {
            // Either deleted or updated by someone else since it was read.
            self.get_affiliate(id).await?;
            return Err(LedgerError::Conflict(format!(
                "affiliate {} changed during update",
                id
            )));
        }
        let after = self.get_affiliate(id).await?;
        info!(
            affiliate_id = %id,
            status = %after.status,
            commission_rate = %after.commission_rate,
            "Affiliate updated"
        );

        if before.status == AffiliateStatus::Pending && after.status == AffiliateStatus::Active {
            let promo = match self.create_welcome_code(&after).await {
                Ok(promo) => Some(promo),
                Err(e) => {
                    warn!(affiliate_id = %id, error = %e, "Welcome promo code not created");
                    None
                }
            };
            if let Err(e) = self.notifier.affiliate_activated(&after, promo.as_ref()).await {
                warn!(affiliate_id = %id, error = %e, "Activation notification failed");
            }
        }
        if before.commission_rate != after.commission_rate {
            if let Err(e) = self
                .notifier
                .commission_rate_changed(&after, before.commission_rate, after.commission_rate)
                .await
            {
                warn!(affiliate_id = %id, error = %e, "Rate change notification failed");
            }
        }

        Ok(after)
    }

    pub async fn delete_affiliate(&self, id: &AffiliateId) -> Result<(), LedgerError> {
        if !self.repo.soft_delete_affiliate(id).await? {
            return Err(LedgerError::NotFound(format!("affiliate {}", id)));
        }
        info!(affiliate_id = %id, "Affiliate deleted");
        Ok(())
    }

    pub async fn update_settings(
        &self,
        id: &AffiliateId,
        patch: SettingsPatch,
    ) -> Result<AffiliateSettings, LedgerError> {
        let mut settings = self.get_affiliate(id).await?.settings;
        settings.apply(patch);
        if !self.repo.update_affiliate_settings(id, &settings).await? {
            return Err(LedgerError::NotFound(format!("affiliate {}", id)));
        }
        Ok(settings)
    }

    /// Create a referral link. The target defaults to the storefront URL.
    pub async fn create_link(
        &self,
        affiliate_id: &AffiliateId,
        code: Option<&str>,
        url: Option<&str>,
    ) -> Result<AffiliateLink, LedgerError> {
        let url = url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .or_else(|| self.config.storefront_url.clone())
            .ok_or_else(|| LedgerError::Invalid("url is required".to_string()))?;
        if !is_valid_target_url(&url) {
            return Err(LedgerError::Invalid(format!("invalid url: {}", url)));
        }
        let code = match code {
            Some(raw) => normalize_code(raw)
                .ok_or_else(|| LedgerError::Invalid(format!("invalid code: {}", raw)))?,
            None => generate_code(),
        };

        match self.repo.insert_link(affiliate_id, &code, &url).await {
            Ok(link) => {
                info!(affiliate_id = %affiliate_id, link_id = %link.id, code = %link.code, "Link created");
                Ok(link)
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::Conflict(format!(
                "link code {} already exists",
                code
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_links(&self, affiliate_id: &AffiliateId) -> Result<Vec<AffiliateLink>, LedgerError> {
        Ok(self.repo.list_links(affiliate_id).await?)
    }

    /// Record a click on a link code and return the link so the caller can
    /// redirect to its target.
    pub async fn track_click(
        &self,
        code: &str,
        ctx: &ClickContext,
    ) -> Result<AffiliateLink, LedgerError> {
        let code = code.trim().to_ascii_uppercase();
        let mut link = self
            .repo
            .get_link_by_code(&code)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("link {}", code)))?;

        let click = self.repo.record_click(&link, ctx).await?;
        link.clicks += 1;
        info!(link_id = %link.id, click_id = %click.id, affiliate_id = %link.affiliate_id, "Click recorded");
        Ok(link)
    }
}
