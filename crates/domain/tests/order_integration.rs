//! Integration tests for orders and payments moving through their lifecycles
//! together, the way gateway events drive them.

use domain::{
    DomainError, FlatRate, FreeShippingOver, Money, Order, OrderLine, OrderStatus, Payment,
    PaymentStatus, PaymentType, Pricing, ShippingPolicy, Transition, UserId,
};

fn lines() -> Vec<OrderLine> {
    vec![
        OrderLine::new("SKU-001", "Widget", 2, Money::from_dollars(10)),
        OrderLine::new("SKU-002", "Gadget", 1, Money::from_dollars(20)),
    ]
}

fn place(policy: &dyn ShippingPolicy) -> Order {
    let lines = lines();
    let pricing = Pricing::for_lines(&lines, policy).unwrap();
    Order::place(UserId::new(), lines, pricing, "1 Main St, Springfield").unwrap()
}

fn payment_for(order: &Order) -> Payment {
    Payment::new(order.id, order.user_id, order.final_price, "pi_0001")
        .with_method("pm_card_visa", PaymentType::Card)
}

mod pricing {
    use super::*;

    #[test]
    fn flat_rate_is_added_to_subtotal() {
        let order = place(&FlatRate(Money::from_dollars(10)));
        assert_eq!(order.total_price, Money::from_dollars(40));
        assert_eq!(order.final_price, Money::from_dollars(50));
    }

    #[test]
    fn free_shipping_threshold_waives_fee() {
        let policy = FreeShippingOver {
            threshold: Money::from_dollars(40),
            fee: Money::from_dollars(10),
        };
        let order = place(&policy);
        assert_eq!(order.shipping_fee, Money::zero());
        assert_eq!(order.final_price, Money::from_dollars(40));
    }
}

mod payment_lifecycle {
    use super::*;

    #[test]
    fn success_moves_payment_and_order_together() {
        let mut order = place(&FlatRate(Money::from_dollars(10)));
        let mut payment = payment_for(&order);

        assert_eq!(
            payment.apply_status(PaymentStatus::Succeeded),
            Transition::Applied
        );
        assert_eq!(
            order.mark_paid(payment.summary()).unwrap(),
            Transition::Applied
        );

        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.payment_info.id.as_deref(), Some("pi_0001"));
        assert_eq!(order.payment_info.status, PaymentStatus::Succeeded);
    }

    #[test]
    fn failure_can_be_followed_by_success() {
        let mut order = place(&FlatRate(Money::zero()));
        let mut payment = payment_for(&order);

        payment.apply_status(PaymentStatus::Failed);
        order.mark_payment_failed(payment.summary()).unwrap();
        assert_eq!(order.status, OrderStatus::PaymentFailed);
        assert!(!order.status.can_accept_payment());

        payment.apply_status(PaymentStatus::Succeeded);
        order.mark_paid(payment.summary()).unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert!(order.paid_at.is_some());
    }

    #[test]
    fn refund_is_mirrored_without_status_change() {
        let mut order = place(&FlatRate(Money::from_dollars(10)));
        let mut payment = payment_for(&order).with_status(PaymentStatus::Succeeded);
        order.mark_paid(payment.summary()).unwrap();

        assert_eq!(
            payment.record_refund(Money::from_dollars(15)),
            Transition::Applied
        );
        assert_eq!(order.mirror_payment(payment.summary()), Transition::Applied);
        assert_eq!(order.mirror_payment(payment.summary()), Transition::Unchanged);

        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(
            order.payment_info.status,
            PaymentStatus::PartiallyRefunded
        );
    }

    #[test]
    fn cancelled_order_rejects_success() {
        let mut order = place(&FlatRate(Money::zero()));
        order.status = OrderStatus::Cancelled;
        let payment = payment_for(&order).with_status(PaymentStatus::Succeeded);

        let err = order.mark_paid(payment.summary()).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidStateTransition {
                current: OrderStatus::Cancelled,
                ..
            }
        ));
        assert_eq!(order.payment_info.status, PaymentStatus::Pending);
    }
}

mod serialization {
    use super::*;

    #[test]
    fn order_round_trips_through_json() {
        let order = place(&FlatRate(Money::from_dollars(10)));
        let json = serde_json::to_value(&order).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["final_price"], 5000);
        assert_eq!(json["payment_info"]["status"], "pending");
        assert!(json["payment_info"]["type"].is_null());

        let back: Order = serde_json::from_value(json).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn statuses_use_snake_case() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::PaymentFailed).unwrap(),
            "\"payment_failed\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentStatus::PartiallyRefunded).unwrap(),
            "\"partially_refunded\""
        );
        assert_eq!(
            "payment_failed".parse::<OrderStatus>().unwrap(),
            OrderStatus::PaymentFailed
        );
    }
}
