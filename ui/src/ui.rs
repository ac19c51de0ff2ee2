use ratatui::{
    buffer::Buffer,
    layout::{ Alignment, Constraint, Direction, Layout, Rect },
    style::{ palette::tailwind, Color, Style },
    symbols,
    text::Text,
    widgets::{
        block::Title,
        Axis,
        Block,
        Borders,
        Cell,
        Chart,
        Dataset,
        Gauge,
        GraphType,
        HighlightSpacing,
        LineGauge,
        Padding,
        Paragraph,
        Row,
        Table,
        Widget,
    },
    DefaultTerminal,
};
use std::{ rc::Rc, time::Duration };
use crossterm::event::{ self, Event, KeyCode, KeyEventKind };
use color_eyre::Result;
use ratatui::prelude::Stylize;

use crate::state::{ CurveSeries, SharedSnapshot };

const CUSTOM_LABEL_COLOR: Color = tailwind::SLATE.c200;
const TRAIN_COLOR: Color = Color::Cyan;
const VAL_COLOR: Color = Color::Yellow;

#[derive(Debug)]
pub struct App {
    pub state: AppState,
    pub snapshot: SharedSnapshot,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    #[default]
    Running,
    Quitting,
}

impl App {
    pub fn run(mut self, mut terminal: DefaultTerminal) -> Result<()> {
        while self.state != AppState::Quitting {
            terminal.draw(|frame| frame.render_widget(&self, frame.area()))?;
            self.handle_events()?;
        }
        Ok(())
    }

    fn handle_events(&mut self) -> Result<()> {
        let timeout = Duration::from_secs_f32(1.0 / 20.0);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => self.quit(),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn quit(&mut self) {
        self.state = AppState::Quitting;
    }
}

impl Widget for &App {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let body = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([Constraint::Max(1), Constraint::Fill(2), Constraint::Max(1)].as_ref())
            .split(area);

        let container = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([Constraint::Length(7), Constraint::Fill(1)].as_ref())
            .split(body[1]);

        let section_progress = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Fill(1)].as_ref())
            .split(container[0]);

        let section_info = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Length(60), Constraint::Fill(1)].as_ref())
            .split(container[1]);

        let section_tables = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)].as_ref())
            .split(section_info[0]);

        let section_charts = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
            .split(section_info[1]);

        render_header(body[0], buf);
        render_footer(body[2], buf);
        self.render_progress(section_progress, buf);
        self.render_charts(section_charts, buf);
        self.render_table_classes(section_tables[0], buf);
        self.render_table_events(section_tables[1], buf);
    }
}

fn render_header(area: Rect, buf: &mut Buffer) {
    Paragraph::new("Training X-ray Classifier")
        .bold()
        .alignment(Alignment::Left)
        .fg(CUSTOM_LABEL_COLOR)
        .render(area, buf);
}

fn render_footer(area: Rect, buf: &mut Buffer) {
    Paragraph::new("Press q to quit")
        .alignment(Alignment::Center)
        .fg(CUSTOM_LABEL_COLOR)
        .bold()
        .render(area, buf);
}

fn calculate_percent(current: u16, max: u16) -> u16 {
    if max == 0 { 0 } else { (current.min(max) * 100) / max }
}

/// Loss over epochs, training against validation.
pub fn render_loss_chart(area: Rect, buf: &mut Buffer, curve: &CurveSeries) {
    let upper = curve.max_y();
    let upper = if upper > 0.0 { upper * 1.1 } else { 1.0 };
    render_curve_chart(area, buf, "Loss", curve, [0.0, upper]);
}

/// AUC over epochs, training against validation.
pub fn render_auc_chart(area: Rect, buf: &mut Buffer, curve: &CurveSeries) {
    render_curve_chart(area, buf, "AUC", curve, [0.0, 1.0]);
}

fn render_curve_chart(
    area: Rect,
    buf: &mut Buffer,
    title: &str,
    curve: &CurveSeries,
    y_bounds: [f64; 2]
) {
    let train_dataset = Dataset::default()
        .name("train")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(TRAIN_COLOR))
        .graph_type(GraphType::Line)
        .data(&curve.train);

    let val_dataset = Dataset::default()
        .name("val")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(VAL_COLOR))
        .graph_type(GraphType::Line)
        .data(&curve.val);

    Chart::new(vec![train_dataset, val_dataset])
        .block(Block::default().borders(Borders::ALL).title(title.to_string()))
        .x_axis(
            Axis::default()
                .title("Epochs")
                .bounds([0.0, curve.max_x()])
                .style(Style::default().fg(Color::Gray))
        )
        .y_axis(
            Axis::default()
                .title(title.to_string())
                .bounds(y_bounds)
                .style(Style::default().fg(Color::Gray))
        )
        .render(area, buf);
}

impl App {
    fn render_progress(&self, area: Rc<[Rect]>, buf: &mut Buffer) {
        let snapshot = self.snapshot.lock().unwrap();

        LineGauge::default()
            .block(Block::default().borders(Borders::ALL).title("Epochs"))
            .filled_style(Style::default().fg(Color::Cyan))
            .ratio(
                (
                    calculate_percent(
                        snapshot.progress.current_epoch,
                        snapshot.progress.max_epoch
                    ) as f64
                ) / 100.0
            )
            .render(area[0], buf);

        Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Batch Progress"))
            .gauge_style(Style::default().fg(Color::Green))
            .ratio(
                (
                    calculate_percent(
                        snapshot.progress.current_batch,
                        snapshot.progress.max_batch
                    ) as f64
                ) / 100.0
            )
            .render(area[1], buf);
    }

    fn render_charts(&self, area: Rc<[Rect]>, buf: &mut Buffer) {
        let snapshot = self.snapshot.lock().unwrap();

        render_loss_chart(area[0], buf, &snapshot.loss);
        render_auc_chart(area[1], buf, &snapshot.auc);
    }

    fn render_table_classes(&self, area: Rect, buf: &mut Buffer) {
        let snapshot = self.snapshot.lock().unwrap();

        let header = Row::new(vec![Cell::from(Text::raw("Class")), Cell::from(Text::raw("Encode"))])
            .style(Style::default())
            .height(1);

        let rows = snapshot.classes.iter().map(|(class, encode)| {
            Row::new(vec![Cell::from(class.clone()), Cell::from(encode.clone())]).height(1)
        });

        Table::new(rows, [Constraint::Min(1), Constraint::Length(8)])
            .header(header)
            .block(title_block("Classes and Labels"))
            .highlight_spacing(HighlightSpacing::Always)
            .render(area, buf);
    }

    fn render_table_events(&self, area: Rect, buf: &mut Buffer) {
        let snapshot = self.snapshot.lock().unwrap();

        let header = Row::new(vec![Cell::from("Event"), Cell::from("Value")])
            .style(Style::default())
            .height(1);

        let rows = snapshot.events
            .iter()
            .rev()
            .map(|(event, value)| {
                Row::new(vec![Cell::from(event.clone()), Cell::from(value.clone())]).height(1)
            });

        Table::new(rows, [Constraint::Percentage(70), Constraint::Percentage(30)])
            .header(header)
            .block(title_block("History"))
            .render(area, buf);
    }
}

fn title_block(title: &str) -> Block {
    let title = Title::from(title).alignment(Alignment::Center);
    Block::new()
        .borders(Borders::ALL)
        .padding(Padding::vertical(1))
        .title(title)
        .fg(CUSTOM_LABEL_COLOR)
}
