use indicatif::{ProgressBar, ProgressStyle};

pub struct ProgressWindow {
    pb: ProgressBar,
    total_len: usize,
}

impl ProgressWindow {
    pub fn new() -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .progress_chars("##-");

        let pb = ProgressBar::new(100);
        pb.set_style(sty);

        Self { pb, total_len: 100 }
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl neural_style::GeneratorProgress for ProgressWindow {
    fn update(&mut self, update: neural_style::ProgressUpdate<'_>) {
        if update.iterations.total != self.total_len {
            self.total_len = update.iterations.total;
            self.pb.set_length(self.total_len as u64);
        }

        self.pb.set_position(update.iterations.current as u64);
        self.pb.set_message(&format!("loss {:.4}", update.total_loss));
    }
}
