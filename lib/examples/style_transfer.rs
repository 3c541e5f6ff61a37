use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let mut args = std::env::args().skip(1);
    let content = args.next().unwrap_or_else(|| "imgs/content.jpg".to_owned());
    let style = args.next().unwrap_or_else(|| "imgs/style.jpg".to_owned());
    let weights = args.next().unwrap_or_else(|| "vgg19.safetensors".to_owned());

    // the torchvision VGG19 feature extractor, exported to safetensors
    let network = ns::FeatureNetwork::vgg19_from_file(&weights)?;

    let session = ns::Session::builder()
        // the layout of the output comes from here
        .content(&content)
        // and the textures and colors from here
        .style(&style)
        .network(network)
        // smaller images and fewer iterations than the defaults, so this
        // finishes in a reasonable time on a CPU
        .image_size(256)
        .iterations(300)
        .learning_rate(0.02)
        .build()?;

    let generated = session.run(Some(Box::new(|update: ns::ProgressUpdate<'_>| {
        if update.iterations.current % 50 == 0 {
            println!(
                "{}/{}: style {:.4} content {:.4}",
                update.iterations.current,
                update.iterations.total,
                update.losses.style_total(),
                update.losses.content_total()
            );
        }
    })))?;

    // save the result to the disk
    generated.save("out/style_transfer.jpg")
}
