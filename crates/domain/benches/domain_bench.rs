use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use domain::{
    FlatRate, Money, Order, OrderLine, Payment, PaymentStatus, PaymentType, Pricing, UserId,
};

fn make_lines(count: usize) -> Vec<OrderLine> {
    (0..count)
        .map(|i| {
            OrderLine::new(
                format!("SKU-{i:04}"),
                format!("Product {i}"),
                (i % 5 + 1) as u32,
                Money::from_cents(999 + i as i64),
            )
        })
        .collect()
}

fn bench_price_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("domain/price_order");
    let policy = FlatRate(Money::from_dollars(10));

    for count in [1, 10, 100] {
        let lines = make_lines(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &lines, |b, lines| {
            b.iter(|| Pricing::for_lines(lines, &policy).unwrap());
        });
    }

    group.finish();
}

fn bench_place_order(c: &mut Criterion) {
    let lines = make_lines(10);
    let pricing = Pricing::for_lines(&lines, &FlatRate(Money::from_dollars(10))).unwrap();

    c.bench_function("domain/place_order", |b| {
        b.iter(|| Order::place(UserId::new(), lines.clone(), pricing, "1 Main St").unwrap());
    });
}

fn bench_reconcile_payment(c: &mut Criterion) {
    let lines = make_lines(3);
    let pricing = Pricing::for_lines(&lines, &FlatRate(Money::from_dollars(10))).unwrap();
    let order = Order::place(UserId::new(), lines, pricing, "1 Main St").unwrap();
    let payment = Payment::new(order.id, order.user_id, order.final_price, "pi_0001")
        .with_method("pm_card_visa", PaymentType::Card);

    c.bench_function("domain/reconcile_success", |b| {
        b.iter(|| {
            let mut order = order.clone();
            let mut payment = payment.clone();
            payment.apply_status(PaymentStatus::Succeeded);
            order.mark_paid(payment.summary()).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_price_order,
    bench_place_order,
    bench_reconcile_payment
);
criterion_main!(benches);
