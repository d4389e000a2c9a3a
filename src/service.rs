// Request handling: admission stages in front of the booking engine

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    booking::{Booking, BookingId, Permission, RoomId, SlotChange, UserId},
    engine::BookingAvailabilityEngine,
    error::BookingError,
    rate_limiter::{CallerId, RateKey, RouteClass},
    registry::ResilienceRegistry,
};

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub caller: CallerId,
    pub permission: Permission,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn user(user_id: UserId) -> Self {
        Self {
            caller: CallerId::User(user_id),
            permission: Permission::OwnBookings(user_id),
            correlation_id: String::new(),
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            caller: CallerId::User(user_id),
            permission: Permission::Administer,
            correlation_id: String::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &RequestContext, route: &RouteClass) -> Result<(), BookingError>;
}

pub struct RateLimitStage {
    registry: Arc<ResilienceRegistry>,
}

impl RateLimitStage {
    pub fn new(registry: Arc<ResilienceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn check(&self, ctx: &RequestContext, route: &RouteClass) -> Result<(), BookingError> {
        let key = RateKey::new(route.clone(), ctx.caller);
        let decision = self.registry.check_rate(&key)?;
        debug!(%key, remaining = decision.remaining, "request admitted");
        Ok(())
    }
}

// Ordered stages; the first rejection ends the request
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub async fn admit(&self, ctx: &RequestContext, route: &RouteClass) -> Result<(), BookingError> {
        for stage in &self.stages {
            if let Err(e) = stage.check(ctx, route).await {
                warn!(stage = stage.name(), %route, caller = %ctx.caller, error = %e, "request rejected");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingRequest {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

pub struct BookingService {
    pipeline: Pipeline,
    engine: Arc<BookingAvailabilityEngine>,
}

impl BookingService {
    pub fn new(pipeline: Pipeline, engine: Arc<BookingAvailabilityEngine>) -> Self {
        Self { pipeline, engine }
    }

    pub fn with_rate_limits(
        registry: Arc<ResilienceRegistry>,
        engine: Arc<BookingAvailabilityEngine>,
    ) -> Self {
        Self::new(Pipeline::new().with_stage(RateLimitStage::new(registry)), engine)
    }

    pub fn engine(&self) -> &BookingAvailabilityEngine {
        &self.engine
    }

    pub async fn create_booking(
        &self,
        ctx: &RequestContext,
        request: CreateBookingRequest,
    ) -> Result<Booking, BookingError> {
        let route = RouteClass::CREATE_BOOKING;
        async {
            self.pipeline.admit(ctx, &route).await?;
            if !ctx.permission.may_act_for(request.user_id) {
                return Err(BookingError::Forbidden(
                    "you can only create bookings for yourself".to_string(),
                ));
            }
            self.engine
                .reserve(
                    request.user_id,
                    request.room_id,
                    request.date,
                    request.start_time,
                    request.end_time,
                )
                .await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    pub async fn update_booking(
        &self,
        ctx: &RequestContext,
        id: BookingId,
        change: SlotChange,
    ) -> Result<Booking, BookingError> {
        let route = RouteClass::UPDATE_BOOKING;
        async {
            self.pipeline.admit(ctx, &route).await?;
            self.engine.reschedule(id, ctx.permission, change).await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    pub async fn cancel_booking(&self, ctx: &RequestContext, id: BookingId) -> Result<Booking, BookingError> {
        let route = RouteClass::CANCEL_BOOKING;
        async {
            self.pipeline.admit(ctx, &route).await?;
            self.engine.cancel(id, ctx.permission).await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    pub async fn complete_booking(&self, ctx: &RequestContext, id: BookingId) -> Result<Booking, BookingError> {
        let route = RouteClass::UPDATE_BOOKING;
        async {
            self.pipeline.admit(ctx, &route).await?;
            self.engine.complete(id, ctx.permission).await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    pub async fn get_booking(&self, ctx: &RequestContext, id: BookingId) -> Result<Booking, BookingError> {
        let route = RouteClass::LIST_BOOKINGS;
        async {
            self.pipeline.admit(ctx, &route).await?;
            let booking = self.engine.get(id).await?;
            if !ctx.permission.may_act_for(booking.user_id) {
                return Err(BookingError::Forbidden(
                    "you can only view your own bookings".to_string(),
                ));
            }
            Ok(booking)
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    // every booking in the system, administrators only
    pub async fn list_bookings(&self, ctx: &RequestContext) -> Result<Vec<Booking>, BookingError> {
        let route = RouteClass::LIST_BOOKINGS;
        async {
            self.pipeline.admit(ctx, &route).await?;
            if !ctx.permission.is_admin() {
                return Err(BookingError::Forbidden(
                    "only administrators can view all bookings".to_string(),
                ));
            }
            self.engine.all_bookings().await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    pub async fn list_room_bookings(
        &self,
        ctx: &RequestContext,
        room_id: RoomId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, BookingError> {
        let route = RouteClass::LIST_BOOKINGS;
        async {
            self.pipeline.admit(ctx, &route).await?;
            self.engine.room_bookings(room_id, date).await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    pub async fn list_user_bookings(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
    ) -> Result<Vec<Booking>, BookingError> {
        let route = RouteClass::LIST_BOOKINGS;
        async {
            self.pipeline.admit(ctx, &route).await?;
            if !ctx.permission.may_act_for(user_id) {
                return Err(BookingError::Forbidden(
                    "you can only view your own bookings".to_string(),
                ));
            }
            self.engine.user_bookings(user_id).await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    pub async fn check_availability(
        &self,
        ctx: &RequestContext,
        room_id: RoomId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<bool, BookingError> {
        let route = RouteClass::CHECK_AVAILABILITY;
        async {
            self.pipeline.admit(ctx, &route).await?;
            self.engine.check_availability(room_id, date, start, end).await
        }
        .instrument(self.span(ctx, &route))
        .await
    }

    fn span(&self, ctx: &RequestContext, route: &RouteClass) -> tracing::Span {
        info_span!("request", %route, caller = %ctx.caller, correlation_id = %ctx.correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        booking::BookingStatus,
        clock::ManualClock,
        config::ServiceConfig,
        dependency::ReferenceValidator,
        error::{ErrorKind, RetryHint},
        mock_services::MockDirectory,
        store::InMemoryBookingStore,
    };
    use std::{net::IpAddr, time::Duration};
    use tokio_test::assert_ok;

    fn service() -> (ManualClock, BookingService) {
        let clock = ManualClock::new();
        let registry = Arc::new(ResilienceRegistry::new(
            ServiceConfig::default(),
            Arc::new(clock.clone()),
        ));
        let directory = Arc::new(MockDirectory::new());
        for id in 1..=3 {
            directory.add_user(id);
            directory.add_room(id, "Available");
        }
        let references = Arc::new(ReferenceValidator::new(directory, registry.clone()));
        let engine = Arc::new(BookingAvailabilityEngine::new(
            Arc::new(InMemoryBookingStore::new()),
            references,
        ));
        (clock, BookingService::with_rate_limits(registry, engine))
    }

    fn request(user_id: UserId, hour: u32) -> CreateBookingRequest {
        CreateBookingRequest {
            user_id,
            room_id: 1,
            date: NaiveDate::from_ymd_opt(2024, 12, 15).unwrap(),
            start_time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(hour, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_create_request_from_json() {
        let parsed: CreateBookingRequest = serde_json::from_str(
            r#"{"user_id": 1, "room_id": 2, "date": "2024-12-15", "start_time": "10:00:00", "end_time": "11:00:00"}"#,
        )
        .unwrap();
        assert_eq!(parsed.room_id, 2);
        assert_eq!(parsed.start_time, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_fifty_first_create_is_rate_limited() {
        let (clock, service) = service();
        let ctx = RequestContext::user(1).with_correlation_id("req-1");

        // every attempt counts, accepted or not
        for _ in 0..50 {
            let _ = service.create_booking(&ctx, request(1, 10)).await;
        }
        let err = service.create_booking(&ctx, request(1, 12)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.to_body().retry, RetryHint::WaitForWindowReset);

        // other route classes keep their own quota
        assert_ok!(service.list_user_bookings(&ctx, 1).await);

        clock.advance(Duration::from_secs(3600));
        assert_ok!(service.create_booking(&ctx, request(1, 12)).await);
    }

    #[tokio::test]
    async fn test_callers_are_throttled_separately() {
        let (_, service) = service();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let anonymous = RequestContext {
            caller: CallerId::Ip(ip),
            permission: Permission::OwnBookings(2),
            correlation_id: "anon".to_string(),
        };
        let ctx = RequestContext::user(1);
        let date = NaiveDate::from_ymd_opt(2024, 12, 15).unwrap();
        let (start, end) = (
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        );

        for _ in 0..100 {
            assert_ok!(service.check_availability(&ctx, 1, date, start, end).await);
        }
        let err = service
            .check_availability(&ctx, 1, date, start, end)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert_ok!(service.check_availability(&anonymous, 1, date, start, end).await);
    }

    #[tokio::test]
    async fn test_users_book_only_for_themselves() {
        let (_, service) = service();

        let err = service
            .create_booking(&RequestContext::user(1), request(2, 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let booking = service
            .create_booking(&RequestContext::admin(3), request(2, 10))
            .await
            .unwrap();
        assert_eq!(booking.user_id, 2);

        let err = service
            .cancel_booking(&RequestContext::user(1), booking.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = service
            .list_user_bookings(&RequestContext::user(1), 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let cancelled = service
            .cancel_booking(&RequestContext::user(2), booking.id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_update_complete_and_room_listing() {
        let (_, service) = service();
        let owner = RequestContext::user(1);
        let booking = service.create_booking(&owner, request(1, 9)).await.unwrap();

        let change = SlotChange {
            room_id: Some(2),
            ..Default::default()
        };
        let moved = service.update_booking(&owner, booking.id, change).await.unwrap();
        assert_eq!(moved.room_id, 2);

        let err = service.complete_booking(&owner, booking.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let done = service
            .complete_booking(&RequestContext::admin(3), booking.id)
            .await
            .unwrap();
        assert_eq!(done.status, BookingStatus::Completed);

        let in_room = service.list_room_bookings(&owner, 2, None).await.unwrap();
        assert_eq!(in_room.len(), 1);
        assert!(service.list_room_bookings(&owner, 1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_booking_and_full_listing_are_permission_checked() {
        let (_, service) = service();
        let owner = RequestContext::user(1);
        let stranger = RequestContext::user(2);
        let admin = RequestContext::admin(3);

        let first = service.create_booking(&owner, request(1, 9)).await.unwrap();
        let second = service.create_booking(&stranger, request(2, 11)).await.unwrap();
        service.cancel_booking(&stranger, second.id).await.unwrap();

        assert_eq!(service.get_booking(&owner, first.id).await.unwrap(), first);
        assert_eq!(service.get_booking(&admin, first.id).await.unwrap().id, first.id);
        let err = service.get_booking(&stranger, first.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = service.get_booking(&owner, BookingId(404)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = service.list_bookings(&owner).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let all = service.list_bookings(&admin).await.unwrap();
        let ids: Vec<_> = all.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(all[0].status, BookingStatus::Cancelled);
    }
}
