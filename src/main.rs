use std::env;
use std::error::Error;
use std::fs::File;
use std::io::{self, Stdout};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use log::Level;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::{Frame, Terminal};

use b3_harness::{
    BramRange, LineKind, ProtocolRev, Reporter, StatusLine, TestCycle, TestRunner, TestSettings,
    VivadoTools,
};

// The main entry point for the operator console.
fn main() -> Result<(), Box<dyn Error>> {
    let Some(com_port) = env::args().nth(1) else {
        list_ports();
        eprintln!("Usage: harness_cli <com-port>");
        return Ok(());
    };

    init_logging()?;

    let (tx, rx) = mpsc::channel();
    let mut app = App::new(com_port, tx, rx);

    let mut terminal = setup_terminal()?;
    let result = run_app(&mut terminal, &mut app);
    restore_terminal(&mut terminal)?;

    // Wind the worker down after the terminal is back to normal so any
    // teardown lines still reach the log file.
    app.runner.join();
    result
}

// Print what the machine has so the operator can pick a port argument.
fn list_ports() {
    match serialport::available_ports() {
        Ok(ports) if !ports.is_empty() => {
            println!("Available serial ports:");
            for port in ports {
                println!("  {}", port.port_name);
            }
        }
        Ok(_) => eprintln!("No serial ports found."),
        Err(e) => eprintln!("Could not enumerate serial ports: {e}"),
    }
}

// Full history goes to test.log; the console pane only keeps the last two
// blocks on screen.
fn init_logging() -> Result<(), Box<dyn Error>> {
    let log_file = File::create("test.log")?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, Box<dyn Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn restore_terminal(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
) -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

struct App {
    settings: TestSettings,
    runner: TestRunner,
    tx: Sender<StatusLine>,
    rx: Receiver<StatusLine>,
    lines: Vec<StatusLine>,
    // Index of the first line of the current display block.
    block_start: usize,
    should_quit: bool,
}

impl App {
    fn new(com_port: String, tx: Sender<StatusLine>, rx: Receiver<StatusLine>) -> Self {
        Self {
            settings: TestSettings::new(com_port),
            runner: TestRunner::new(),
            tx,
            rx,
            lines: Vec::new(),
            block_start: 0,
            should_quit: false,
        }
    }

    fn drain_status(&mut self) {
        while let Ok(line) = self.rx.try_recv() {
            self.push_line(line);
        }
    }

    // Keep the previous block and the one now starting; older output lives
    // on in test.log.
    fn push_line(&mut self, line: StatusLine) {
        if line.kind == LineKind::BlockStart {
            self.lines.drain(..self.block_start);
            self.block_start = self.lines.len();
        }
        self.lines.push(line);
    }

    fn handle_key(&mut self, code: KeyCode) {
        let s = &mut self.settings;
        match code {
            KeyCode::Char('1') => s.enable_xadc = !s.enable_xadc,
            KeyCode::Char('2') => s.enable_flash_id = !s.enable_flash_id,
            KeyCode::Char('3') => s.enable_flash_verify = !s.enable_flash_verify,
            KeyCode::Char('4') => s.enable_uart_echo = !s.enable_uart_echo,
            KeyCode::Char('5') => s.enable_dio_test = !s.enable_dio_test,
            KeyCode::Char('6') => s.enable_mouse = !s.enable_mouse,
            KeyCode::Char('7') => s.enable_bram_test = !s.enable_bram_test,
            KeyCode::Char('m') => s.dio_mode = s.dio_mode.cycled(),
            KeyCode::Char('[') => s.dio_divider = s.dio_divider.saturating_sub(1),
            KeyCode::Char(']') => s.dio_divider = s.dio_divider.saturating_add(1),
            KeyCode::Char('p') => {
                let range = s.bram_range.get_or_insert_with(BramRange::default);
                range.passes = range.passes % 8 + 1;
            }
            KeyCode::Char('b') => {
                let range = s.bram_range.get_or_insert_with(BramRange::default);
                range.both_banks = !range.both_banks;
            }
            KeyCode::Char('v') => {
                s.protocol = match s.protocol {
                    ProtocolRev::Rev1 => ProtocolRev::Rev2,
                    ProtocolRev::Rev2 => ProtocolRev::Rev1,
                };
            }
            KeyCode::Char('s') => self.start_run(),
            KeyCode::Char('x') => self.runner.request_stop(),
            KeyCode::Char('q') => {
                self.runner.request_stop();
                self.should_quit = true;
            }
            _ => {}
        }
    }

    fn start_run(&mut self) {
        // TestRunner rejects a second start on its own; the settings are
        // snapshotted here and stay fixed for the run.
        let reporter = Reporter::new(self.tx.clone());
        let cycle = TestCycle::new(self.settings.clone(), VivadoTools::new("."), reporter);
        self.runner.start(cycle);
    }
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn Error>> {
    loop {
        app.drain_status();
        terminal.draw(|frame| ui(frame, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key.code);
                }
            }
        }
        if app.should_quit {
            return Ok(());
        }
    }
}

fn ui(frame: &mut Frame, app: &App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(1)])
        .split(frame.size());
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(42), Constraint::Min(30)])
        .split(rows[0]);

    frame.render_widget(settings_panel(app), columns[0]);
    frame.render_widget(log_panel(app, columns[1].height), columns[1]);

    let help = Paragraph::new(
        "1-7 toggle checks | m mode | [/] divider | p passes | b banks | v rev | s start | x stop | q quit",
    )
    .style(Style::default().add_modifier(Modifier::DIM));
    frame.render_widget(help, rows[1]);
}

fn settings_panel(app: &App) -> Paragraph<'_> {
    let s = &app.settings;
    let flag = |on: bool| if on { "[x]" } else { "[ ]" };
    let mut lines = vec![
        Line::from(format!("Port: {}", s.com_port)),
        Line::from(""),
        Line::from(format!("{} 1 XADC readout", flag(s.enable_xadc))),
        Line::from(format!("{} 2 Flash read ID", flag(s.enable_flash_id))),
        Line::from(format!("{} 3 Flash verify", flag(s.enable_flash_verify))),
        Line::from(format!("{} 4 UART echo", flag(s.enable_uart_echo))),
        Line::from(format!("{} 5 DIO test", flag(s.enable_dio_test))),
        Line::from(format!("{} 6 Mouse", flag(s.enable_mouse))),
        Line::from(format!("{} 7 BRAM test", flag(s.enable_bram_test))),
        Line::from(""),
        Line::from(format!("DIO mode:    {}", s.dio_mode.label())),
        Line::from(format!("DIO divider: {}", s.dio_divider)),
        Line::from(format!(
            "Protocol:    {}",
            match s.protocol {
                ProtocolRev::Rev1 => "rev 1",
                ProtocolRev::Rev2 => "rev 2",
            }
        )),
    ];
    match &s.bram_range {
        Some(range) => {
            lines.push(Line::from(format!(
                "BRAM passes: {} ({})",
                range.passes,
                if range.both_banks { "both banks" } else { "one bank" }
            )));
        }
        None => lines.push(Line::from("BRAM passes: firmware default")),
    }

    Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Settings (next run)"),
    )
}

fn log_panel(app: &App, height: u16) -> Paragraph<'_> {
    let visible = height.saturating_sub(2) as usize;
    let start = app.lines.len().saturating_sub(visible);
    let lines: Vec<Line> = app.lines[start..]
        .iter()
        .map(|line| {
            let style = match line.level {
                Level::Error => Style::default().fg(Color::Red),
                Level::Warn => Style::default().fg(Color::Yellow),
                _ if line.kind == LineKind::BlockStart => {
                    Style::default().add_modifier(Modifier::BOLD)
                }
                _ => Style::default(),
            };
            Line::styled(line.text.clone(), style)
        })
        .collect();

    let title = if app.runner.is_running() {
        "Log (running)"
    } else {
        "Log (idle)"
    };
    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title))
}
