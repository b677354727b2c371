use sea_orm::sea_query::{OnConflict, Query};
use sea_orm::{ConnectionTrait, DatabaseTransaction};

use crate::entities::referral_reward_entity as rewards;
use crate::error::{AppError, AppResult};
use crate::models::ReferralRewardApplied;
use crate::services::AccountStore;
use crate::utils::time;

/// Credits the buyer's referrer once per purchase. Only ever called inside
/// the finalizing transaction so a rolled back purchase leaves no reward.
pub struct ReferralRewarder;

impl ReferralRewarder {
    pub async fn apply(
        txn: &DatabaseTransaction,
        purchase_ref: &str,
        buyer_id: i64,
        reward_amount: i64,
    ) -> AppResult<Option<ReferralRewardApplied>> {
        if reward_amount <= 0 {
            return Ok(None);
        }
        let Some(buyer) = AccountStore::find(txn, buyer_id).await? else {
            return Err(AppError::NotFound(format!("Account {buyer_id} not found")));
        };
        let Some(referrer_id) = buyer.referrer_id else {
            return Ok(None);
        };

        let mut insert = Query::insert();
        insert
            .into_table(rewards::Entity)
            .columns([
                rewards::Column::ReferrerId,
                rewards::Column::ReferredId,
                rewards::Column::PurchaseRef,
                rewards::Column::Amount,
                rewards::Column::CreatedAt,
            ])
            .values([
                referrer_id.into(),
                buyer_id.into(),
                purchase_ref.into(),
                reward_amount.into(),
                time::now().into(),
            ])
            .map_err(|e| AppError::InternalError(e.to_string()))?
            .on_conflict(
                OnConflict::columns([rewards::Column::ReferrerId, rewards::Column::PurchaseRef])
                    .do_nothing()
                    .to_owned(),
            );
        let stmt = txn.get_database_backend().build(&insert);
        let res = txn.execute(stmt).await?;
        if res.rows_affected() == 0 {
            log::info!("Referral reward for {purchase_ref} already granted to {referrer_id}");
            return Ok(None);
        }

        AccountStore::increase_balance(txn, referrer_id, reward_amount).await?;
        log::info!(
            "Referral reward {reward_amount} credited to {referrer_id} for purchase {purchase_ref}"
        );
        Ok(Some(ReferralRewardApplied {
            referrer_id,
            amount: reward_amount,
        }))
    }
}
