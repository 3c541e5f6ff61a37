use neural_style as ns;
use ns::ndarray::{Array1, Array4};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

fn solid(color: [u8; 3]) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_pixel(8, 8, ns::image::Rgb(color)))
}

fn pattern(seed: u32) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(24, 16, |x, y| {
        ns::image::Rgb([
            ((x * 37 + y * 11 + seed * 50) % 256) as u8,
            ((x * 5 + y * 23 + seed * 90) % 256) as u8,
            ((x * y + seed * 7) % 256) as u8,
        ])
    }))
}

/// A small VGG shaped network with random weights
fn random_network() -> Arc<ns::FeatureNetwork> {
    Arc::new(
        ns::FeatureNetwork::builder(7)
            .conv(8, 3)
            .relu()
            .conv(8, 3)
            .relu()
            .max_pool(2, 2)
            .conv(12, 3)
            .relu()
            .conv(12, 3)
            .relu()
            .max_pool(2, 2)
            .conv(16, 3)
            .relu()
            .build(),
    )
}

/// Five 1x1 identity convolutions, each followed by an activation, so every
/// loss compares the normalized pixels themselves
fn identity_network() -> Arc<ns::FeatureNetwork> {
    let identity = || {
        let weight = Array4::from_shape_fn((3, 3, 1, 1), |(o, i, _, _)| if o == i { 1.0 } else { 0.0 });
        ns::Layer::Conv2d(ns::Conv2d::new(weight, Array1::zeros(3), 1, 0).unwrap())
    };

    let mut layers = Vec::new();
    for _ in 0..5 {
        layers.push(identity());
        layers.push(ns::Layer::Relu);
    }

    Arc::new(ns::FeatureNetwork::new(layers))
}

fn channel_means(t: &Array4<f32>) -> [f32; 3] {
    let mut means = [0.0; 3];
    for (c, mean) in means.iter_mut().enumerate() {
        let plane = t.index_axis(ns::ndarray::Axis(1), c);
        *mean = plane.sum() / plane.len() as f32;
    }
    means
}

#[test]
fn solid_colors_move_toward_style() {
    let content = [153u8, 230, 128];
    let style = [230u8, 128, 242];

    let progress: Box<dyn ns::GeneratorProgress> = Box::new(|update: ns::ProgressUpdate<'_>| {
        assert!(update.losses.is_finite(), "non finite loss at {}", update.iterations.current);
        assert!(update.total_loss.is_finite());
    });

    let generated = ns::Session::builder()
        .content(solid(content))
        .style(solid(style))
        .network(identity_network())
        .image_size(8)
        .iterations(100)
        .style_weight(1e6)
        .content_weight(100.0)
        .learning_rate(0.01)
        .max_thread_count(1)
        .build()
        .unwrap()
        .run(Some(progress))
        .unwrap();

    assert_eq!(generated.stop_reason(), ns::StopReason::Completed);
    assert_eq!(generated.iterations(), 100);
    assert_eq!(generated.final_losses().content.len(), 2);
    assert_eq!(generated.final_losses().style.len(), 5);
    assert!(generated.final_losses().is_finite());

    let means = channel_means(generated.tensor());
    for c in 0..3 {
        let from = f32::from(content[c]) / 255.0;
        let to = f32::from(style[c]) / 255.0;

        assert!(
            (means[c] - to).abs() < (from - to).abs() - 0.05,
            "channel {} ended at {}, content {} style {}",
            c,
            means[c],
            from,
            to
        );
    }
}

#[test]
fn loss_decreases_over_time() {
    const N: usize = 30;

    let totals = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = Arc::clone(&totals);
    let progress: Box<dyn ns::GeneratorProgress> = Box::new(move |update: ns::ProgressUpdate<'_>| {
        if let Ok(mut totals) = recorded.lock() {
            totals.push(update.total_loss);
        }
    });

    ns::Session::builder()
        .content(pattern(0))
        .style(pattern(1))
        .network(random_network())
        .image_size(16)
        .iterations(2 * N as u32)
        .content_weight(1.0)
        .style_weight(100.0)
        .learning_rate(0.005)
        .max_thread_count(1)
        .build()
        .unwrap()
        .run(Some(progress))
        .unwrap();

    let totals = totals.lock().unwrap();
    assert_eq!(totals.len(), 2 * N);

    let window = |end: usize| totals[end - 5..end].iter().sum::<f32>() / 5.0;
    assert!(window(2 * N) <= window(N) * 1.01, "{} > {}", window(2 * N), window(N));
    assert!(totals[2 * N - 1] < totals[0]);
}

#[test]
fn output_stays_in_range() {
    let generated = ns::Session::builder()
        .content(pattern(2))
        .style(pattern(3))
        .network(random_network())
        .image_size(16)
        .iterations(5)
        .learning_rate(0.5)
        .initial_target(ns::InitialTarget::Noise { seed: 3 })
        .max_thread_count(2)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    assert!(generated.tensor().iter().all(|v| (0.0..=1.0).contains(v)));
    assert_eq!(generated.as_ref().dimensions(), (24, 16));
}

#[test]
fn zero_content_weight_ignores_content() {
    let run = |builder: ns::SessionBuilder<'static>| {
        builder
            .content(pattern(0))
            .style(pattern(1))
            .network(random_network())
            .image_size(16)
            .iterations(10)
            .content_weight(0.0)
            .style_weight(1.0)
            .learning_rate(0.01)
            .max_thread_count(1)
            .build()
            .unwrap()
            .run(None)
            .unwrap()
    };

    let weighted_out = run(ns::Session::builder());
    let no_content = run(ns::Session::builder().content_layers(Vec::new()));

    assert_eq!(weighted_out.tensor(), no_content.tensor());
    // the content losses are still measured and reported
    assert_eq!(weighted_out.final_losses().content.len(), 2);
    assert!(weighted_out.final_losses().content_total() > 0.0);
    assert!(no_content.final_losses().content.is_empty());
}

#[test]
fn cancelled_run_returns_initial_image() {
    let cancel = Arc::new(AtomicBool::new(false));

    let session = ns::Session::builder()
        .content(pattern(0))
        .style(pattern(1))
        .network(random_network())
        .image_size(16)
        .iterations(1000)
        .cancel_flag(Arc::clone(&cancel))
        .max_thread_count(1)
        .build()
        .unwrap();

    let initial = session.initial_target().clone();
    cancel.store(true, Ordering::Relaxed);

    let generated = session.run(None).unwrap();
    assert_eq!(generated.stop_reason(), ns::StopReason::Cancelled);
    assert_eq!(generated.iterations(), 0);
    assert_eq!(generated.tensor(), &initial);
}

#[test]
fn initial_target_matches_content_dims() {
    let session = ns::Session::builder()
        .content(pattern(0))
        .style(solid([1, 2, 3]))
        .initial_target(ns::InitialTarget::Image(ns::ImageSource::from(solid([200, 100, 50]))))
        .network(random_network())
        .image_size(8)
        .build()
        .unwrap();

    // 24x16 scaled so the shorter edge is 8
    assert_eq!(session.initial_target().shape(), &[1, 3, 8, 12]);
    assert!((channel_means(session.initial_target())[0] - 200.0 / 255.0).abs() < 5e-3);
}

#[test]
fn default_model_layout() {
    let session = ns::Session::builder()
        .content(pattern(0))
        .style(pattern(1))
        .network(identity_network())
        .image_size(8)
        .build()
        .unwrap();

    let model = session.model();
    assert_eq!(model.content_losses().count(), 2);
    assert_eq!(model.style_losses().count(), 5);
    // normalization, 5 conv + 4 relu up to conv_5, 7 observers
    assert_eq!(model.len(), 1 + 9 + 7);
}

#[test]
fn missing_layers_fail_the_build() {
    let err = ns::Session::builder()
        .content(pattern(0))
        .style(pattern(1))
        .network(random_network())
        .image_size(16)
        .style_layers(vec![
            "conv_1".parse::<ns::LayerName>().unwrap(),
            "conv_12".parse().unwrap(),
        ])
        .build()
        .err()
        .unwrap();

    match err {
        ns::Error::MissingLayers(missing) => assert_eq!(missing, vec!["conv_12"]),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn missing_inputs() {
    let err = ns::Session::builder()
        .style(pattern(1))
        .network(random_network())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ns::Error::MissingInput(_)));

    let err = ns::Session::builder()
        .content(pattern(0))
        .style(pattern(1))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ns::Error::MissingInput(_)));
}

#[test]
fn invalid_parameters() {
    let base = || {
        ns::Session::builder()
            .content(pattern(0))
            .style(pattern(1))
            .network(random_network())
    };

    let invalid: Vec<ns::SessionBuilder<'static>> = vec![
        base().style_weight(-1.0),
        base().content_weight(f32::NAN),
        base().style_weight(0.0).content_weight(0.0),
        base().learning_rate(0.0),
        base().image_size(0),
        base().max_thread_count(0),
        base().log_interval(0),
    ];

    for builder in invalid {
        assert!(matches!(builder.build(), Err(ns::Error::InvalidRange(_))));
    }
}
